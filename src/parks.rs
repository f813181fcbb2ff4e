//! POTA park reference loading.
//!
//! The park list is the stock CSV export with (at least) `reference` and
//! `active` columns. Only active rows load; references stay verbatim for
//! display and get their dash stripped when keyed.

use std::path::Path;

use crate::Result;

/// Parse active park references out of CSV text. Uppercased, deduped, in
/// file order.
pub fn parse_active_park_refs(text: &str) -> Vec<String> {
    let mut lines = text.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let reference_idx = columns.iter().position(|c| *c == "reference");
    let active_idx = columns.iter().position(|c| *c == "active");
    let (Some(reference_idx), Some(active_idx)) = (reference_idx, active_idx) else {
        return Vec::new();
    };

    let mut refs = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let reference = fields
            .get(reference_idx)
            .map(|r| r.to_ascii_uppercase())
            .unwrap_or_default();
        let active = fields.get(active_idx).copied().unwrap_or("");
        if reference.is_empty() || active != "1" {
            continue;
        }
        if !refs.contains(&reference) {
            refs.push(reference);
        }
    }
    refs
}

/// Load a park reference pool file.
pub fn load_park_refs_file(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path.as_ref())?;
    Ok(parse_active_park_refs(&data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_rows_load() {
        let text = "reference,name,active\nUS-1234,Some Park,1\nUS-9999,Closed,0\nes-0001,Otro,1\nUS-1234,Dup,1\n";
        assert_eq!(parse_active_park_refs(text), vec!["US-1234", "ES-0001"]);
    }

    #[test]
    fn header_order_does_not_matter() {
        let text = "active,reference\n1,K-0059\n0,K-0001\n";
        assert_eq!(parse_active_park_refs(text), vec!["K-0059"]);
    }

    #[test]
    fn missing_columns_yield_nothing() {
        assert!(parse_active_park_refs("name,thing\nfoo,bar\n").is_empty());
        assert!(parse_active_park_refs("").is_empty());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parks.csv");
        std::fs::write(&path, "reference,active\nUS-0001,1\n").unwrap();
        assert_eq!(load_park_refs_file(&path).unwrap(), vec!["US-0001"]);
    }
}
