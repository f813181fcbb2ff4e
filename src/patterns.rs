//! Exchange pattern set: validation regexes and TX templates.
//!
//! Rule keys are partitioned by the state that consumes them (`s0.*`,
//! `s2.*`, `s5.*`) plus the `tx.*` reply templates. Validation values are
//! lists of regexes tried in order against the compacted message;
//! placeholders like `{MY_CALL}` are substituted before compilation.
//! Defaults ship in the binary; a provider (normally a YAML file) may
//! override any subset and falls back to the defaults when unreadable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::Result;

pub type PatternList = Vec<String>;

/// The full rule set for one session.
#[derive(Debug, Clone)]
pub struct ExchangePatterns {
    pub s0: HashMap<String, PatternList>,
    pub s2: HashMap<String, PatternList>,
    pub s5: HashMap<String, PatternList>,
    pub tx: HashMap<String, String>,
}

impl Default for ExchangePatterns {
    fn default() -> Self {
        let report = r"(?:[1-5][1-9N][9N])";
        let s0 = HashMap::from([
            (
                "SIMPLE".to_string(),
                // A plain CQ may omit the DE.
                vec![
                    r"^.*(?:CQ)+.*DE.*(?:{MY_CALL})+.*K.*$".to_string(),
                    r"^.*(?:CQ)+.*(?:{MY_CALL})+.*K.*$".to_string(),
                ],
            ),
            (
                "POTA".to_string(),
                vec![r"^.*(?:CQ)+.*POTA.*DE.*(?:{MY_CALL})+.*K.*$".to_string()],
            ),
            (
                "SOTA".to_string(),
                vec![r"^.*(?:CQ)+.*SOTA.*DE.*(?:{MY_CALL})+.*K.*$".to_string()],
            ),
        ]);
        let s2 = HashMap::from([
            (
                "report_require_call".to_string(),
                vec![format!("^.*{{OTHER_CALL}}.*{report}.*{report}.*$")],
            ),
            (
                "report_require_call_allow_599".to_string(),
                vec![format!("^.*{{OTHER_CALL}}.*{report}.*{report}.*$")],
            ),
            (
                "report_no_call".to_string(),
                vec![format!("^.*{report}.*{report}.*$")],
            ),
            (
                "report_no_call_allow_599".to_string(),
                vec![format!("^.*{report}.*{report}.*$")],
            ),
            ("p2p_ack".to_string(), vec![r"^{OTHER_CALL}$".to_string()]),
        ]);
        let s5 = HashMap::from([
            (
                "with_prosign".to_string(),
                vec![r"^.*{PROSIGN}.*73.*EE.*$".to_string()],
            ),
            (
                "with_prosign_allow_tu".to_string(),
                vec![r"^.*{PROSIGN}.*TU.*73.*EE.*$".to_string()],
            ),
            (
                "without_prosign".to_string(),
                vec![r"^.*73.*EE.*$".to_string()],
            ),
            (
                "without_prosign_allow_tu".to_string(),
                vec![r"^.*TU.*73.*EE.*$".to_string()],
            ),
            (
                "p2p_with_prosign".to_string(),
                vec![
                    r"^.*{PROSIGN}.*{OTHER_CALL_REAL}.*{MY_CALL}.*MY.*REF.*{MY_PARK_REF}.*{MY_PARK_REF}.*$"
                        .to_string(),
                ],
            ),
            (
                "p2p_with_prosign_allow_tu".to_string(),
                vec![
                    r"^.*{PROSIGN}.*{OTHER_CALL_REAL}.*{MY_CALL}.*MY.*REF.*{MY_PARK_REF}.*{MY_PARK_REF}.*TU.*73.*$"
                        .to_string(),
                ],
            ),
            (
                "p2p_without_prosign".to_string(),
                vec![
                    r"^.*{OTHER_CALL_REAL}.*{MY_CALL}.*MY.*REF.*{MY_PARK_REF}.*{MY_PARK_REF}.*$"
                        .to_string(),
                ],
            ),
            (
                "p2p_without_prosign_allow_tu".to_string(),
                vec![
                    r"^.*{OTHER_CALL_REAL}.*{MY_CALL}.*MY.*REF.*{MY_PARK_REF}.*{MY_PARK_REF}.*TU.*73.*$"
                        .to_string(),
                ],
            ),
        ]);
        let tx = HashMap::from([
            ("caller_call".to_string(), "{CALL} {CALL}".to_string()),
            (
                "repeat_selected_call".to_string(),
                "{OTHER_CALL} {OTHER_CALL}".to_string(),
            ),
            ("ack_rr".to_string(), "RR".to_string()),
            (
                "report_reply".to_string(),
                "{TX_PROSIGN} UR 5NN 5NN TU 73 {TX_PROSIGN}".to_string(),
            ),
            ("qso_complete".to_string(), "EE".to_string()),
            (
                "p2p_repeat_call".to_string(),
                "{OTHER_CALL_REAL} {OTHER_CALL_REAL}".to_string(),
            ),
            (
                "p2p_repeat_ref".to_string(),
                "{PARK_REF} {PARK_REF}".to_string(),
            ),
            (
                "p2p_station_reply_without_tu".to_string(),
                "R R {OTHER_CALL_REAL} {OTHER_CALL_REAL} MY REF {PARK_REF} {PARK_REF} 73 {TX_PROSIGN}"
                    .to_string(),
            ),
            (
                "p2p_station_reply_with_tu".to_string(),
                "R R {OTHER_CALL_REAL} {OTHER_CALL_REAL} MY REF {PARK_REF} {PARK_REF} TU 73 {TX_PROSIGN}"
                    .to_string(),
            ),
        ]);
        Self { s0, s2, s5, tx }
    }
}

impl ExchangePatterns {
    /// Merge overrides from YAML text. Returns warnings for keys that do
    /// not name any known rule.
    pub fn merge_yaml(&mut self, text: &str) -> Result<Vec<String>> {
        let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
        let root = match raw.get("patterns") {
            Some(node) => node,
            None => &raw,
        };
        let Some(map) = root.as_mapping() else {
            return Err(crate::Error::msg("pattern file root is not a mapping"));
        };
        let mut warnings = Vec::new();
        for (section, node) in map {
            let Some(section) = section.as_str() else {
                continue;
            };
            match section {
                "s0" => merge_pattern_section(&mut self.s0, node, true, &mut warnings),
                "s2" => merge_pattern_section(&mut self.s2, node, false, &mut warnings),
                "s5" => merge_pattern_section(&mut self.s5, node, false, &mut warnings),
                "tx" => merge_template_section(&mut self.tx, node, &mut warnings),
                other => warnings.push(format!("unknown pattern section '{other}' ignored")),
            }
        }
        Ok(warnings)
    }
}

/// File-backed pattern source.
pub trait PatternProvider {
    /// The full rule set, or an error if the source is unusable.
    fn patterns(&self) -> Result<ExchangePatterns>;
}

/// Standard provider: YAML file with a `patterns:` root (or the sections
/// directly at top level).
pub struct YamlFileProvider {
    path: PathBuf,
}

impl YamlFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PatternProvider for YamlFileProvider {
    fn patterns(&self) -> Result<ExchangePatterns> {
        let text = std::fs::read_to_string(&self.path)?;
        let mut patterns = ExchangePatterns::default();
        for warning in patterns.merge_yaml(&text)? {
            log::warn!("{}: {warning}", self.path.display());
        }
        Ok(patterns)
    }
}

/// Resolve the rule set from an optional provider. A missing or invalid
/// provider falls back to the defaults; the returned string describes why.
pub fn load(provider: Option<&dyn PatternProvider>) -> (ExchangePatterns, Option<String>) {
    match provider {
        None => (ExchangePatterns::default(), None),
        Some(p) => match p.patterns() {
            Ok(patterns) => (patterns, None),
            Err(e) => (
                ExchangePatterns::default(),
                Some(format!("pattern provider failed, using defaults: {e}")),
            ),
        },
    }
}

/// Convenience for CLI use: optional file path as provider.
pub fn load_file(path: Option<&Path>) -> (ExchangePatterns, Option<String>) {
    match path {
        None => load(None),
        Some(p) => load(Some(&YamlFileProvider::new(p))),
    }
}

fn merge_pattern_section(
    section: &mut HashMap<String, PatternList>,
    node: &serde_yaml::Value,
    uppercase_keys: bool,
    warnings: &mut Vec<String>,
) {
    let Some(map) = node.as_mapping() else {
        return;
    };
    for (key, value) in map {
        let Some(key) = key.as_str() else { continue };
        let key = if uppercase_keys {
            key.trim().to_ascii_uppercase()
        } else {
            key.trim().to_string()
        };
        if key.is_empty() {
            continue;
        }
        if !section.contains_key(&key) {
            warnings.push(format!("unknown pattern key '{key}' ignored"));
            continue;
        }
        let list = as_pattern_list(value);
        if !list.is_empty() {
            section.insert(key, list);
        }
    }
}

fn merge_template_section(
    section: &mut HashMap<String, String>,
    node: &serde_yaml::Value,
    warnings: &mut Vec<String>,
) {
    let Some(map) = node.as_mapping() else {
        return;
    };
    for (key, value) in map {
        let (Some(key), Some(value)) = (key.as_str(), value.as_str()) else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        if !section.contains_key(&key) {
            warnings.push(format!("unknown tx template '{key}' ignored"));
            continue;
        }
        section.insert(key, value);
    }
}

fn as_pattern_list(value: &serde_yaml::Value) -> PatternList {
    match value {
        serde_yaml::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                vec![]
            } else {
                vec![s.to_string()]
            }
        }
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => vec![],
    }
}
