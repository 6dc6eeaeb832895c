use std::collections::BTreeSet;

const MIN_TOKEN_CHARS: usize = 2;

/// Split text into lowercase word tokens on non-alphanumeric boundaries.
///
/// Unicode aware, so "Felsökning" stays one token. Tokens shorter than two
/// characters are dropped. Order is first occurrence; duplicates removed.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.chars().count() < MIN_TOKEN_CHARS {
            continue;
        }
        let token = raw.to_lowercase();
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out
}

/// Normalize a free-text term for case-insensitive comparisons.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}
