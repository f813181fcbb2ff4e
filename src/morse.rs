//! Morse code table and token handling.
//!
//! The table is ITU letters and digits plus the punctuation used on the
//! air in a CW exchange (`?`, `/`, `=`, `+`, and the sentence marks).
//! Prosigns are multi-letter tokens written `<AR>` style; they key with no
//! inter-letter gap and decode back to the same bracketed token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Dits and dahs for every supported character.
pub const MORSE_TABLE: [(char, &str); 43] = [
    ('A', ".-"),
    ('B', "-..."),
    ('C', "-.-."),
    ('D', "-.."),
    ('E', "."),
    ('F', "..-."),
    ('G', "--."),
    ('H', "...."),
    ('I', ".."),
    ('J', ".---"),
    ('K', "-.-"),
    ('L', ".-.."),
    ('M', "--"),
    ('N', "-."),
    ('O', "---"),
    ('P', ".--."),
    ('Q', "--.-"),
    ('R', ".-."),
    ('S', "..."),
    ('T', "-"),
    ('U', "..-"),
    ('V', "...-"),
    ('W', ".--"),
    ('X', "-..-"),
    ('Y', "-.--"),
    ('Z', "--.."),
    ('0', "-----"),
    ('1', ".----"),
    ('2', "..---"),
    ('3', "...--"),
    ('4', "....-"),
    ('5', "....."),
    ('6', "-...."),
    ('7', "--..."),
    ('8', "---.."),
    ('9', "----."),
    ('/', "-..-."),
    ('?', "..--.."),
    ('=', "-...-"),
    ('+', ".-.-."),
    ('.', ".-.-.-"),
    (',', "--..--"),
    ('-', "-....-"),
];

/// Code for one character, if it is keyable.
pub fn code_for(ch: char) -> Option<&'static str> {
    let ch = ch.to_ascii_uppercase();
    MORSE_TABLE
        .iter()
        .find(|(c, _)| *c == ch)
        .map(|(_, code)| *code)
}

/// Character for one dit/dah pattern.
pub fn char_for(pattern: &str) -> Option<char> {
    static DECODE: OnceLock<HashMap<&'static str, char>> = OnceLock::new();
    let map = DECODE.get_or_init(|| MORSE_TABLE.iter().map(|(c, p)| (*p, *c)).collect());
    map.get(pattern).copied()
}

/// Dit/dah pattern of a prosign literal keyed without letter gaps, e.g.
/// `CAVE` becomes `-.-..--...-.`. `None` if the literal has unkeyable
/// characters.
pub fn prosign_pattern(literal: &str) -> Option<String> {
    let lit = clean_prosign_literal(literal);
    if lit.is_empty() {
        return None;
    }
    let mut pattern = String::new();
    for ch in lit.chars() {
        pattern.push_str(code_for(ch)?);
    }
    Some(pattern)
}

/// Prosign literal with anything unkeyable stripped, uppercased.
pub fn clean_prosign_literal(literal: &str) -> String {
    literal
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Bracketed prosign token for a literal, e.g. `<CAVE>`.
pub fn prosign_token(literal: &str) -> String {
    let lit = clean_prosign_literal(literal);
    if lit.is_empty() {
        "<CAVE>".to_string()
    } else {
        format!("<{lit}>")
    }
}

/// Collapse whitespace runs and uppercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Split text into sendable tokens: bracketed prosigns stay whole, runs of
/// keyable characters group into words, everything else is dropped.
pub fn tokenize_text(text: &str) -> Vec<String> {
    let norm = normalize_text(text);
    let mut out = Vec::new();
    let mut chars = norm.chars();
    let mut word = String::new();
    while let Some(c) = chars.next() {
        if c == '<' {
            if !word.is_empty() {
                out.push(std::mem::take(&mut word));
            }
            let mut inner = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '>' {
                    closed = true;
                    break;
                }
                inner.push(c);
            }
            if closed && !inner.is_empty() && inner.chars().all(|c| c.is_ascii_alphanumeric()) {
                out.push(format!("<{inner}>"));
            }
            continue;
        }
        if is_token_char(c) {
            word.push(c);
        } else if !word.is_empty() {
            out.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        out.push(word);
    }
    out
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '?' | '=' | '+' | '.' | ',' | '-' | '*')
}

/// Characters of a token as they will be keyed: prosign brackets removed.
pub fn token_chars(token: &str) -> impl Iterator<Item = char> + '_ {
    let inner = token
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .unwrap_or(token);
    inner.chars()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_roundtrip() {
        for (ch, code) in MORSE_TABLE {
            assert_eq!(code_for(ch), Some(code));
            assert_eq!(char_for(code), Some(ch));
        }
        assert_eq!(char_for("......."), None);
    }

    #[test]
    fn prosign_patterns() {
        assert_eq!(prosign_pattern("CAVE").as_deref(), Some("-.-..--...-."));
        assert_eq!(prosign_pattern("kn").as_deref(), Some("-.--."));
        assert_eq!(prosign_pattern(""), None);
        assert_eq!(prosign_token("cave"), "<CAVE>");
    }

    #[test]
    fn tokenize() {
        assert_eq!(
            tokenize_text("  cq pota de ea1abc k "),
            vec!["CQ", "POTA", "DE", "EA1ABC", "K"]
        );
        assert_eq!(
            tokenize_text("<cave> 73 ee"),
            vec!["<CAVE>", "73", "EE"]
        );
        assert_eq!(tokenize_text("ea3?"), vec!["EA3?"]);
        assert_eq!(tokenize_text("!!"), Vec::<String>::new());
    }
}
