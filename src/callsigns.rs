//! Callsign pool loading.
//!
//! One call per line; `#` starts a comment; only the first comma-separated
//! field counts, so plain lists and CSV exports both work.

use std::path::Path;

use crate::Result;

/// Parse callsigns out of pool file text. Uppercased, deduped, in file
/// order.
pub fn parse_callsign_text(text: &str) -> Vec<String> {
    let mut calls = Vec::new();
    for raw in text.lines() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let first = line
            .split(',')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_uppercase();
        if first.is_empty() || first.starts_with('#') {
            continue;
        }
        if !calls.contains(&first) {
            calls.push(first);
        }
    }
    calls
}

/// Load a callsign pool file.
pub fn load_callsigns_file(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path.as_ref())?;
    Ok(parse_callsign_text(&data))
}
