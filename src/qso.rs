//! QSO state machine.
//!
//! Drives the scripted exchange: a CQ from the operator raises a small
//! pileup of simulated stations, the operator picks one, trades reports,
//! and closes out. Validation is regex-driven over a compacted form of the
//! decoded message, replies come from TX templates, and both rule sets are
//! overridable through [`crate::patterns`].
//!
//! `feed` is deterministic given the machine state, the pools, and the
//! injected RNG. It mutates nothing outside the machine and describes all
//! side effects as [`Effect`] values for the runtime to execute.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, RngCore, SeedableRng};
use regex::Regex;
use serde::Serialize;

use crate::event::{Event, EventKind};
use crate::patterns::ExchangePatterns;
use crate::{Float, morse};

/// Exchange protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QsoState {
    /// Waiting for the operator's CQ.
    S0Idle,
    /// Stations are calling in.
    S1ReplyCall,
    /// Waiting for station selection / signal report.
    S2WaitReport,
    /// Report reply sent (direct flow).
    S3ReplyReport,
    /// Report reply sent (legacy flow).
    S4ReplyOther,
    /// Waiting for the final 73.
    S5WaitFinal,
    /// Contact registered, acknowledging.
    S6ReplyEe,
}

/// CQ flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CqMode {
    Simple,
    Pota,
    Sota,
}

impl CqMode {
    pub fn key(&self) -> &'static str {
        match self {
            CqMode::Simple => "SIMPLE",
            CqMode::Pota => "POTA",
            CqMode::Sota => "SOTA",
        }
    }
}

impl std::str::FromStr for CqMode {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(CqMode::Simple),
            "POTA" => Ok(CqMode::Pota),
            "SOTA" => Ok(CqMode::Sota),
            other => Err(crate::Error::msg(format!("unknown CQ mode '{other}'"))),
        }
    }
}

/// Ack prefix used by the legacy exchange flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum S4Prefix {
    R,
    Rr,
}

impl S4Prefix {
    pub fn key(&self) -> &'static str {
        match self {
            S4Prefix::R => "R",
            S4Prefix::Rr => "RR",
        }
    }
}

impl std::str::FromStr for S4Prefix {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "R" => Ok(S4Prefix::R),
            "RR" => Ok(S4Prefix::Rr),
            other => Err(crate::Error::msg(format!("unknown S4 prefix '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QsoConfig {
    pub my_call: String,
    /// Fallback remote call when the pool is empty.
    pub other_call: String,
    pub cq_mode: CqMode,
    /// Upper bound on stations answering one CQ.
    pub max_stations: usize,
    /// Chance (0-100) of a fresh caller appearing after a QSO with an
    /// empty queue, without a new CQ.
    pub incoming_call_percent: Float,
    /// Chance (0-100) of one caller being Park-to-Park. POTA mode only.
    pub p2p_percent: Float,
    pub my_park_ref: String,
    pub allow_599: bool,
    pub allow_tu: bool,
    pub use_prosigns: bool,
    pub prosign_literal: String,
    pub s4_prefix: S4Prefix,
    /// Direct flow (default) or the legacy split exchange.
    pub direct_flow: bool,
    /// Per-station TX speed range, WPM.
    pub wpm_out: (Float, Float),
    /// Per-station TX pitch range, Hz.
    pub tone_out_hz: (Float, Float),
    pub ignore_bk: bool,
    pub ignore_fill_tokens: Vec<String>,
}

impl Default for QsoConfig {
    fn default() -> Self {
        Self {
            my_call: "EA4XYZ".to_string(),
            other_call: "N1MM".to_string(),
            cq_mode: CqMode::Pota,
            max_stations: 1,
            incoming_call_percent: 0.0,
            p2p_percent: 0.0,
            my_park_ref: "EA-0000".to_string(),
            allow_599: false,
            allow_tu: false,
            use_prosigns: true,
            prosign_literal: "CAVE".to_string(),
            s4_prefix: S4Prefix::Rr,
            direct_flow: true,
            wpm_out: (20.0, 20.0),
            tone_out_hz: (600.0, 600.0),
            ignore_bk: true,
            ignore_fill_tokens: vec!["RR".to_string(), "R".to_string(), "DE".to_string()],
        }
    }
}

/// One queued caller.
#[derive(Debug, Clone, Serialize)]
pub struct Station {
    pub call: String,
    pub is_p2p: bool,
    pub park_ref: Option<String>,
    pub delay_ms: u64,
}

/// A finished contact, as it goes into the session log.
#[derive(Debug, Clone, Serialize)]
pub struct QsoRecord {
    pub ts: u64,
    pub call: String,
    pub p2p: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub park_ref: Option<String>,
    pub wpm_used: Float,
    pub tone_used: Float,
}

/// One transmission for the encoder worker.
#[derive(Debug, Clone, PartialEq)]
pub struct TxJob {
    pub text: String,
    pub wpm: Float,
    pub tone_hz: Float,
    pub delay_ms: u64,
}

/// What `feed` wants the runtime to do.
#[derive(Debug, Clone)]
pub enum Effect {
    Tx(TxJob),
    StateChange(QsoState),
    Complete(QsoRecord),
    Event(Event),
}

#[derive(Debug, Clone)]
struct Active {
    call_real: String,
    alias: String,
    is_p2p: bool,
    park_ref: Option<String>,
}

/// Session export payload (`/export` in simulate mode, export button in the
/// UI glue).
#[derive(Debug, Clone, Serialize)]
pub struct SessionExport {
    pub state: QsoState,
    pub config: QsoConfig,
    pub completions: Vec<QsoRecord>,
    pub rx_transcript: Vec<String>,
    pub tx_transcript: Vec<String>,
}

pub struct QsoMachine {
    config: QsoConfig,
    patterns: ExchangePatterns,
    state: QsoState,
    rng: Box<dyn RngCore + Send>,

    call_pool: Vec<String>,
    park_pool: Vec<String>,
    pending: Vec<Station>,
    active: Option<Active>,
    call_selected: bool,
    rr_confirmed: bool,
    profiles: HashMap<String, (Float, Float)>,

    regex_cache: HashMap<String, Regex>,
    deferred: Vec<Event>,

    rx_transcript: Vec<String>,
    tx_transcript: Vec<String>,
    completions: Vec<QsoRecord>,
}

impl QsoMachine {
    pub fn new(config: QsoConfig) -> Self {
        Self::with_parts(
            config,
            ExchangePatterns::default(),
            Box::new(rand::rngs::StdRng::from_os_rng()),
        )
    }

    /// Full dependency injection: pattern set and RNG.
    pub fn with_parts(
        config: QsoConfig,
        patterns: ExchangePatterns,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            config,
            patterns,
            state: QsoState::S0Idle,
            rng,
            call_pool: Vec::new(),
            park_pool: Vec::new(),
            pending: Vec::new(),
            active: None,
            call_selected: false,
            rr_confirmed: false,
            profiles: HashMap::new(),
            regex_cache: HashMap::new(),
            deferred: Vec::new(),
            rx_transcript: Vec::new(),
            tx_transcript: Vec::new(),
            completions: Vec::new(),
        }
    }

    pub fn state(&self) -> QsoState {
        self.state
    }

    pub fn config(&self) -> &QsoConfig {
        &self.config
    }

    pub fn pending_stations(&self) -> &[Station] {
        &self.pending
    }

    pub fn completions(&self) -> &[QsoRecord] {
        &self.completions
    }

    /// Replace the dynamic callsign pool. Cleaned, uppercased, deduped.
    pub fn set_call_pool(&mut self, calls: impl IntoIterator<Item = String>) {
        self.call_pool.clear();
        for call in calls {
            let c = call.trim().to_ascii_uppercase();
            if !c.is_empty() && !self.call_pool.contains(&c) {
                self.call_pool.push(c);
            }
        }
        if self.call_pool.is_empty() {
            log::info!("callsign pool empty, using fixed other_call");
        } else {
            log::info!("loaded {} callsigns", self.call_pool.len());
        }
    }

    /// Replace the park reference pool.
    pub fn set_park_pool(&mut self, refs: impl IntoIterator<Item = String>) {
        self.park_pool.clear();
        for r in refs {
            let r = r.trim().to_ascii_uppercase();
            if !r.is_empty() && !self.park_pool.contains(&r) {
                self.park_pool.push(r);
            }
        }
    }

    /// Back to S0, dropping the queue and the transcripts. Completions
    /// survive. Calling it twice is the same as calling it once.
    pub fn reset(&mut self) {
        self.state = QsoState::S0Idle;
        self.pending.clear();
        self.active = None;
        self.call_selected = false;
        self.rr_confirmed = false;
        self.rx_transcript.clear();
        self.tx_transcript.clear();
        log::info!("QSO reset");
    }

    pub fn export_session(&self) -> SessionExport {
        SessionExport {
            state: self.state,
            config: self.config.clone(),
            completions: self.completions.clone(),
            rx_transcript: self.rx_transcript.clone(),
            tx_transcript: self.tx_transcript.clone(),
        }
    }

    /// Process one whole decoded message.
    pub fn feed(&mut self, text: &str) -> Vec<Effect> {
        let tokens = morse::tokenize_text(text);
        if tokens.is_empty() {
            return vec![Effect::Event(Event::new(
                EventKind::QsoUnexpectedInput,
                format!("no usable tokens in {text:?}"),
            ))];
        }
        self.rx_transcript.push(tokens.join(" "));

        let mut effects = match self.state {
            QsoState::S0Idle => self.handle_s0(&tokens),
            QsoState::S2WaitReport => self.handle_s2(&tokens),
            QsoState::S5WaitFinal => self.handle_s5(&tokens),
            state => vec![self.unexpected(&tokens, format!("message in transient {state:?}"))],
        };
        for event in self.deferred.drain(..) {
            effects.push(Effect::Event(event));
        }
        effects
    }

    // ---- state handlers ----

    fn handle_s0(&mut self, tokens: &[String]) -> Vec<Effect> {
        let mode = self.config.cq_mode.key();
        let rules = self.patterns.s0.get(mode).cloned().unwrap_or_default();
        let values = self.values();
        if !self.match_rules(&rules, tokens, &values) {
            return vec![self.unexpected(tokens, format!("no CQ match for mode {mode}"))];
        }

        self.call_selected = false;
        self.rr_confirmed = false;
        self.pending = self.draw_callers();
        let mut effects = vec![Effect::StateChange(QsoState::S1ReplyCall)];
        if !self.announce_pending(&mut effects) {
            return effects;
        }
        self.state = QsoState::S2WaitReport;
        effects.push(Effect::StateChange(self.state));
        effects
    }

    fn handle_s2(&mut self, tokens: &[String]) -> Vec<Effect> {
        if !self.call_selected {
            return self.handle_s2_select(tokens);
        }
        let Some(active) = self.active.clone() else {
            return vec![self.unexpected(tokens, "no station selected")];
        };

        if self.is_full_call_query(tokens, &active.alias) {
            self.rr_confirmed = true;
            return match self.tx_template("ack_rr", &self.values()) {
                Ok(text) => vec![self.tx(text, &active.call_real, 0)],
                Err(e) => self.template_failure(e),
            };
        }
        if has_repeat_request(tokens) {
            return self.repeat_station(&active);
        }
        self.handle_s2_report(tokens)
    }

    fn handle_s2_select(&mut self, tokens: &[String]) -> Vec<Effect> {
        if self.pending.is_empty() {
            return vec![self.unexpected(tokens, "no stations pending selection")];
        }

        // A P2P ack picks the queued P2P station.
        if let Some(idx) = self.pending.iter().position(|s| s.is_p2p) {
            let mut values = self.values();
            values.insert("OTHER_CALL", "P2P".to_string());
            let rules = self.rules_s2("p2p_ack");
            if self.match_rules(&rules, tokens, &values) {
                self.select_station(idx);
                return self.reply_p2p_exchange();
            }
        }

        // Full-call query (`EA3IMR?`) selects that station and acks RR.
        if let Some(idx) = self
            .pending
            .iter()
            .position(|s| self.is_full_call_query(tokens, &s.call))
        {
            let call_real = self.pending[idx].call.clone();
            self.select_station(idx);
            self.rr_confirmed = true;
            return match self.tx_template("ack_rr", &self.values()) {
                Ok(text) => vec![self.tx(text, &call_real, 0)],
                Err(e) => self.template_failure(e),
            };
        }

        // Partial patterns (`EA3?`) make every matching caller repeat.
        let wildcards = extract_wildcard_patterns(tokens);
        if !wildcards.is_empty() {
            let matches: Vec<Station> = self
                .pending
                .iter()
                .filter(|s| wildcards.iter().any(|p| wildcard_matches(p, &s.call)))
                .cloned()
                .collect();
            let mut effects = Vec::new();
            for station in &matches {
                effects.extend(self.announce_station(station, true));
            }
            return effects;
        }

        // Exact call anywhere in the message selects and, with a report in
        // the same breath, completes the S2 step.
        let joined = compact_join(tokens);
        if let Some(idx) = self.find_exact_pending(&joined) {
            self.select_station(idx);
            return self.handle_s2_report(tokens);
        }

        vec![self.unexpected(tokens, "no queued station matches")]
    }

    fn handle_s2_report(&mut self, tokens: &[String]) -> Vec<Effect> {
        let Some(active) = self.active.clone() else {
            return vec![self.unexpected(tokens, "no station selected")];
        };
        let cleaned = self.strip_fillers(tokens, self.config.ignore_bk);

        if active.is_p2p {
            let mut values = self.values();
            values.insert("OTHER_CALL", active.alias.clone());
            let rules = self.rules_s2("p2p_ack");
            if !self.match_rules(&rules, &cleaned, &values) {
                return vec![self.unexpected(tokens, "P2P station expects a P2P ack")];
            }
            return self.reply_p2p_exchange();
        }

        let require_call = !self.call_selected && !self.rr_confirmed;
        let mut key = if require_call {
            "report_require_call".to_string()
        } else {
            "report_no_call".to_string()
        };
        if self.config.allow_599 {
            key.push_str("_allow_599");
        }
        let rules = self.rules_s2(&key);
        let values = self.values();
        if !self.match_rules(&rules, &cleaned, &values) {
            return vec![self.unexpected(tokens, format!("report does not match '{key}'"))];
        }

        let reply = match self.tx_template("report_reply", &values) {
            Ok(text) => self.flow_prefixed(text),
            Err(e) => return self.template_failure(e),
        };
        self.rr_confirmed = false;
        let interim = if self.config.direct_flow {
            QsoState::S3ReplyReport
        } else {
            QsoState::S4ReplyOther
        };
        let mut effects = vec![Effect::StateChange(interim)];
        effects.push(self.tx(reply, &active.call_real, 0));
        self.state = QsoState::S5WaitFinal;
        effects.push(Effect::StateChange(self.state));
        effects
    }

    fn handle_s5(&mut self, tokens: &[String]) -> Vec<Effect> {
        let active = self.active.clone();

        // P2P help tokens first; they contain '?' and must win over the
        // generic repeat request.
        if let Some(active) = active.as_ref().filter(|a| a.is_p2p && a.park_ref.is_some()) {
            let joined = compact_join(tokens);
            let key = match joined.as_str() {
                "CALL?" => Some("p2p_repeat_call"),
                "REF?" => Some("p2p_repeat_ref"),
                _ => None,
            };
            if let Some(key) = key {
                let call = active.call_real.clone();
                return match self.tx_template(key, &self.values()) {
                    Ok(text) => vec![self.tx(text, &call, 0)],
                    Err(e) => self.template_failure(e),
                };
            }
        }

        if has_repeat_request(tokens) {
            let Some(last) = self.tx_transcript.last().cloned() else {
                return vec![self.unexpected(tokens, "nothing to repeat")];
            };
            let call = active.map(|a| a.call_real).unwrap_or_default();
            return vec![self.tx(last, &call, 0)];
        }

        let strip_bk = self.config.ignore_bk && !self.config.use_prosigns;
        let cleaned = self.strip_fillers(&collapse_double_e(tokens), strip_bk);

        let is_p2p = self
            .active
            .as_ref()
            .is_some_and(|a| a.is_p2p && a.park_ref.is_some());
        let mut key = String::new();
        if is_p2p {
            key.push_str("p2p_");
        }
        key.push_str(if self.config.use_prosigns {
            "with_prosign"
        } else {
            "without_prosign"
        });
        if self.config.allow_tu {
            key.push_str("_allow_tu");
        }
        let rules = self.patterns.s5.get(&key).cloned().unwrap_or_default();
        let values = self.values();
        if !self.match_rules(&rules, &cleaned, &values) {
            return vec![self.unexpected(tokens, format!("close-out does not match '{key}'"))];
        }
        self.complete_qso()
    }

    // ---- side-effect builders ----

    fn draw_callers(&mut self) -> Vec<Station> {
        let max = self.config.max_stations.max(1);
        let requested = self.rng.random_range(1..=max as u64) as usize;

        let pool = self.call_pool.clone();
        let mut calls: Vec<String> = if pool.is_empty() {
            vec![self.config.other_call.to_ascii_uppercase()]
        } else {
            let n = requested.min(pool.len()).max(1);
            pool.choose_multiple(&mut *self.rng, n).cloned().collect()
        };
        calls.shuffle(&mut *self.rng);

        let p2p_idx = self.pick_p2p_index(&calls);
        let mut stations: Vec<Station> = calls
            .into_iter()
            .enumerate()
            .map(|(idx, call)| {
                let is_p2p = Some(idx) == p2p_idx;
                let park_ref = if is_p2p {
                    self.park_pool.choose(&mut *self.rng).cloned()
                } else {
                    None
                };
                Station {
                    call,
                    is_p2p,
                    park_ref,
                    delay_ms: self.rng.random_range(0..=2000),
                }
            })
            .collect();
        // The P2P caller, if any, goes first.
        stations.sort_by_key(|s| !s.is_p2p);
        stations
    }

    fn pick_p2p_index(&mut self, calls: &[String]) -> Option<usize> {
        if self.config.cq_mode != CqMode::Pota || calls.is_empty() || self.park_pool.is_empty() {
            return None;
        }
        let p = (self.config.p2p_percent / 100.0).clamp(0.0, 1.0);
        if p <= 0.0 || self.rng.random::<Float>() >= p {
            return None;
        }
        Some(self.rng.random_range(0..calls.len() as u64) as usize)
    }

    /// Returns false if a template failed and the machine already fell
    /// back to idle.
    fn announce_pending(&mut self, effects: &mut Vec<Effect>) -> bool {
        for station in self.pending.clone() {
            let batch = self.announce_station(&station, false);
            let failed = batch.iter().any(|e| {
                matches!(e, Effect::Event(ev) if ev.kind == EventKind::TemplateUnresolved)
            });
            effects.extend(batch);
            if failed {
                return false;
            }
        }
        true
    }

    /// A station calls in (or repeats itself): call twice, plus park ref
    /// for a P2P caller. `repeat` announcements go out immediately.
    fn announce_station(&mut self, station: &Station, repeat: bool) -> Vec<Effect> {
        let delay = if repeat { 0 } else { station.delay_ms };
        let mut values = self.values();
        values.insert("CALL", compact_token(&station.call));
        values.insert("OTHER_CALL", compact_token(&station.call));
        values.insert("OTHER_CALL_REAL", compact_token(&station.call));
        let templates: &[&str] = if station.is_p2p {
            values.insert(
                "PARK_REF",
                compact_token(station.park_ref.as_deref().unwrap_or_default()),
            );
            &["p2p_repeat_call", "p2p_repeat_ref"]
        } else if repeat {
            &["repeat_selected_call"]
        } else {
            &["caller_call"]
        };
        let mut parts = Vec::new();
        for key in templates {
            match self.tx_template(key, &values) {
                Ok(text) => parts.push(text),
                Err(e) => return self.template_failure(e),
            }
        }
        vec![self.tx(parts.join(" "), &station.call, delay)]
    }

    fn repeat_station(&mut self, active: &Active) -> Vec<Effect> {
        let station = Station {
            call: active.call_real.clone(),
            is_p2p: active.is_p2p,
            park_ref: active.park_ref.clone(),
            delay_ms: 0,
        };
        self.announce_station(&station, true)
    }

    fn reply_p2p_exchange(&mut self) -> Vec<Effect> {
        let Some(active) = self.active.clone() else {
            return self.template_failure("P2P reply without an active station".to_string());
        };
        let key = if self.config.allow_tu {
            "p2p_station_reply_with_tu"
        } else {
            "p2p_station_reply_without_tu"
        };
        let mut values = self.values();
        values.insert("OTHER_CALL_REAL", compact_token(&active.call_real));
        values.insert(
            "PARK_REF",
            compact_token(active.park_ref.as_deref().unwrap_or_default()),
        );
        let reply = match self.tx_template(key, &values) {
            Ok(text) => text,
            Err(e) => return self.template_failure(e),
        };
        self.rr_confirmed = false;
        let interim = if self.config.direct_flow {
            QsoState::S3ReplyReport
        } else {
            QsoState::S4ReplyOther
        };
        let mut effects = vec![Effect::StateChange(interim)];
        effects.push(self.tx(reply, &active.call_real, 0));
        self.state = QsoState::S5WaitFinal;
        effects.push(Effect::StateChange(self.state));
        effects
    }

    fn complete_qso(&mut self) -> Vec<Effect> {
        let Some(active) = self.active.clone() else {
            return self.template_failure("completion without an active station".to_string());
        };
        let (wpm, tone) = self.profile_for(&active.call_real);
        let record = QsoRecord {
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            call: active.call_real.clone(),
            p2p: active.is_p2p,
            park_ref: active.park_ref.clone(),
            wpm_used: wpm,
            tone_used: tone,
        };
        self.completions.push(record.clone());

        let mut effects = vec![Effect::StateChange(QsoState::S6ReplyEe)];
        self.state = QsoState::S6ReplyEe;
        match self.tx_template("qso_complete", &self.values()) {
            Ok(text) => effects.push(self.tx(text, &active.call_real, 0)),
            Err(e) => return self.template_failure(e),
        }
        effects.push(Effect::Complete(record));
        effects.push(Effect::Event(Event::new(
            EventKind::QsoComplete,
            format!("worked {}", active.call_real),
        )));

        self.state = QsoState::S0Idle;
        self.active = None;
        self.call_selected = false;
        self.rr_confirmed = false;

        if !self.pending.is_empty() {
            // Leftover callers try again; incoming probability does not
            // apply while the queue drains.
            if self.announce_pending(&mut effects) {
                self.state = QsoState::S2WaitReport;
            }
        } else if self.roll_incoming() {
            self.pending = self.draw_callers();
            if self.announce_pending(&mut effects) {
                self.state = QsoState::S2WaitReport;
            }
        }
        effects.push(Effect::StateChange(self.state));
        effects
    }

    fn roll_incoming(&mut self) -> bool {
        let p = (self.config.incoming_call_percent / 100.0).clamp(0.0, 1.0);
        p > 0.0 && (p >= 1.0 || self.rng.random::<Float>() < p)
    }

    fn select_station(&mut self, idx: usize) {
        let station = self.pending.remove(idx);
        let alias = if station.is_p2p {
            "P2P".to_string()
        } else {
            station.call.clone()
        };
        self.active = Some(Active {
            call_real: station.call,
            alias,
            is_p2p: station.is_p2p,
            park_ref: station.park_ref,
        });
        self.call_selected = true;
        self.rr_confirmed = false;
    }

    fn find_exact_pending(&self, joined: &str) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| {
                let needle = compact_token(&s.call);
                joined.find(&needle).map(|pos| (pos, idx))
            })
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, idx)| idx)
    }

    fn profile_for(&mut self, call: &str) -> (Float, Float) {
        if let Some(profile) = self.profiles.get(call) {
            return *profile;
        }
        let (wlo, whi) = self.config.wpm_out;
        let (tlo, thi) = self.config.tone_out_hz;
        let wpm = if whi > wlo {
            self.rng.random_range(wlo..=whi)
        } else {
            wlo
        };
        let tone = if thi > tlo {
            self.rng.random_range(tlo..=thi)
        } else {
            tlo
        };
        self.profiles.insert(call.to_string(), (wpm, tone));
        (wpm, tone)
    }

    fn tx(&mut self, text: String, station_call: &str, delay_ms: u64) -> Effect {
        let (wpm, tone_hz) = self.profile_for(station_call);
        self.tx_transcript.push(text.clone());
        log::debug!("TX [{station_call}] {text}");
        Effect::Tx(TxJob {
            text,
            wpm,
            tone_hz,
            delay_ms,
        })
    }

    fn unexpected(&mut self, tokens: &[String], detail: impl Into<String>) -> Effect {
        let detail = detail.into();
        Effect::Event(Event::new(
            EventKind::QsoUnexpectedInput,
            format!("{:?} in {:?}: {detail}", tokens.join(" "), self.state),
        ))
    }

    /// Template failed to resolve: refuse the TX and fall back to idle.
    fn template_failure(&mut self, detail: String) -> Vec<Effect> {
        self.state = QsoState::S0Idle;
        self.active = None;
        self.call_selected = false;
        self.rr_confirmed = false;
        self.pending.clear();
        vec![
            Effect::Event(Event::new(EventKind::TemplateUnresolved, detail)),
            Effect::StateChange(QsoState::S0Idle),
        ]
    }

    fn flow_prefixed(&self, reply: String) -> String {
        if self.config.direct_flow {
            reply
        } else {
            format!("{} {reply}", self.config.s4_prefix.key())
        }
    }

    // ---- pattern plumbing ----

    fn rules_s2(&self, key: &str) -> Vec<String> {
        self.patterns.s2.get(key).cloned().unwrap_or_default()
    }

    fn values(&self) -> HashMap<&'static str, String> {
        let other = self
            .active
            .as_ref()
            .map(|a| a.alias.clone())
            .unwrap_or_else(|| self.config.other_call.to_ascii_uppercase());
        let park = self
            .active
            .as_ref()
            .and_then(|a| a.park_ref.clone())
            .unwrap_or_default();
        let my_park = if self.config.my_park_ref.trim().is_empty() {
            "EA-0000".to_string()
        } else {
            self.config.my_park_ref.clone()
        };
        HashMap::from([
            ("MY_CALL", compact_token(&self.config.my_call)),
            ("OTHER_CALL", compact_token(&other)),
            ("CALL", compact_token(&other)),
            (
                "OTHER_CALL_REAL",
                compact_token(
                    &self
                        .active
                        .as_ref()
                        .map(|a| a.call_real.clone())
                        .unwrap_or_else(|| self.config.other_call.clone()),
                ),
            ),
            (
                "PROSIGN",
                compact_token(&morse::prosign_token(&self.config.prosign_literal)),
            ),
            ("TX_PROSIGN", self.tx_prosign()),
            ("PARK_REF", compact_token(&park)),
            ("MY_PARK_REF", compact_token(&my_park)),
        ])
    }

    fn tx_prosign(&self) -> String {
        let literal = morse::clean_prosign_literal(&self.config.prosign_literal);
        if literal.is_empty() {
            "KN".to_string()
        } else {
            literal
        }
    }

    fn match_rules(
        &mut self,
        rules: &[String],
        tokens: &[String],
        values: &HashMap<&'static str, String>,
    ) -> bool {
        let compact = compact_join(tokens);
        for rule in rules {
            let rendered = render_pattern(rule, values);
            let regex = match self.compiled(&rendered) {
                Some(regex) => regex,
                None => continue,
            };
            if regex.is_match(&compact) {
                return true;
            }
        }
        false
    }

    fn compiled(&mut self, rendered: &str) -> Option<&Regex> {
        if !self.regex_cache.contains_key(rendered) {
            match Regex::new(&format!("^(?:{rendered})$")) {
                Ok(regex) => {
                    self.regex_cache.insert(rendered.to_string(), regex);
                }
                Err(e) => {
                    self.deferred.push(Event::new(
                        EventKind::PatternsInvalid,
                        format!("bad exchange pattern {rendered:?}: {e}"),
                    ));
                    return None;
                }
            }
        }
        self.regex_cache.get(rendered)
    }

    fn tx_template(
        &self,
        key: &str,
        values: &HashMap<&'static str, String>,
    ) -> Result<String, String> {
        let Some(template) = self.patterns.tx.get(key) else {
            return Err(format!("missing tx template '{key}'"));
        };
        let mut rendered = template.clone();
        for (name, value) in values {
            rendered = rendered.replace(&format!("{{{name}}}"), value);
        }
        if let Some(unresolved) = find_placeholder(&rendered) {
            return Err(format!("tx template '{key}' leaves {unresolved} unresolved"));
        }
        Ok(clean_spacing(&rendered))
    }

    fn is_full_call_query(&self, tokens: &[String], call: &str) -> bool {
        let call = compact_token(call);
        if call.is_empty() {
            return false;
        }
        let needle = format!("{call}?");
        let compact: Vec<String> = tokens
            .iter()
            .map(|t| compact_token(t))
            .filter(|t| !t.is_empty())
            .collect();
        if compact.join("") == needle {
            return true;
        }
        compact.iter().enumerate().any(|(i, t)| {
            *t == needle || (*t == call && compact.get(i + 1).is_some_and(|n| n == "?"))
        })
    }

    fn strip_fillers(&self, tokens: &[String], ignore_bk: bool) -> Vec<String> {
        let single = tokens
            .iter()
            .filter(|t| compact_token(t).len() == 1)
            .count();
        // Char-by-char sending ("U R") would lose real words to filler
        // stripping; keep the raw stream in that mode.
        if single >= 4.max((0.6 * tokens.len().max(1) as f64) as usize) {
            return tokens.to_vec();
        }
        let mut fillers: Vec<String> = self
            .config
            .ignore_fill_tokens
            .iter()
            .map(|t| t.to_ascii_uppercase())
            .collect();
        if ignore_bk {
            fillers.push("BK".to_string());
        }
        tokens
            .iter()
            .filter(|t| !fillers.contains(&t.to_ascii_uppercase()))
            .cloned()
            .collect()
    }
}

// ---- token helpers ----

/// Compacted form used for matching: uppercase, prosign brackets removed,
/// everything outside `A-Z 0-9 ? / = +` dropped.
pub fn compact_token(token: &str) -> String {
    let inner = token
        .trim()
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .unwrap_or(token.trim());
    inner
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '?' | '/' | '=' | '+'))
        .collect()
}

fn compact_join(tokens: &[String]) -> String {
    tokens.iter().map(|t| compact_token(t)).collect()
}

fn render_pattern(pattern: &str, values: &HashMap<&'static str, String>) -> String {
    let mut rendered = pattern.to_string();
    for (name, value) in values {
        rendered = rendered.replace(&format!("{{{name}}}"), &regex::escape(value));
    }
    rendered
}

fn find_placeholder(text: &str) -> Option<&str> {
    static PLACEHOLDER: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\{[A-Z_]+\}").unwrap());
    re.find(text).map(|m| m.as_str())
}

fn clean_spacing(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_repeat_request(tokens: &[String]) -> bool {
    tokens.iter().any(|t| t.contains('?'))
}

fn collapse_double_e(tokens: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "E" && tokens.get(i + 1).is_some_and(|t| t == "E") {
            out.push("EE".to_string());
            i += 2;
        } else {
            out.push(tokens[i].clone());
            i += 1;
        }
    }
    out
}

fn wildcard_matches(pattern: &str, call: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let escaped = regex::escape(pattern).replace(r"\?", ".*");
    match Regex::new(&format!("^{escaped}$")) {
        Ok(re) => re.is_match(&compact_token(call)),
        Err(_) => false,
    }
}

fn extract_wildcard_patterns(tokens: &[String]) -> Vec<String> {
    let compact: Vec<String> = tokens
        .iter()
        .map(|t| compact_token(t))
        .filter(|t| !t.is_empty())
        .collect();
    let mut patterns = Vec::new();
    let mut any_question = false;
    for tok in &compact {
        if !tok.contains('?') {
            continue;
        }
        any_question = true;
        // A lone '?' would match everything; handled below.
        if !tok.chars().any(|c| c.is_ascii_alphanumeric()) {
            continue;
        }
        if !patterns.contains(tok) {
            patterns.push(tok.clone());
        }
    }
    let joined = compact.join("");
    if joined.contains('?') {
        any_question = true;
        if joined.chars().any(|c| c.is_ascii_alphanumeric()) && !patterns.contains(&joined) {
            patterns.push(joined);
        }
    }
    if patterns.is_empty() && any_question {
        // Bare '?': every queued caller repeats.
        patterns.push("?".to_string());
    }
    patterns
}
