//! Text normalization shared by the catalog store and the matching code.
//!
//! Every string that takes part in a comparison goes through NFC first, so
//! that a pre-composed `й` and `и` + combining breve compare equal. Catalog
//! identity keys and the matcher both build on [`fold`].

use unicode_normalization::UnicodeNormalization;

/// Compose to NFC.
pub fn nfc(text: &str) -> String {
    text.nfc().collect()
}

/// NFC, lowercase, trimmed, inner whitespace collapsed to single spaces.
pub fn fold(text: &str) -> String {
    let composed: String = text.nfc().collect();
    composed
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Folded words: split on anything that is not a letter or digit.
pub fn words(text: &str) -> Vec<String> {
    fold(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalized identity key of a catalog record.
pub fn identity_key(title: &str, author: &str) -> (String, String) {
    (fold(title), fold(author))
}
