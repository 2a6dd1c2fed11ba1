//! Utility functions and helpers.

pub mod http;
pub mod log;
pub mod url;

use std::sync::LazyLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("punctuation pattern is valid"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Normalize an anime title for duplicate detection.
///
/// Punctuation and whitespace are dropped, Latin letters lowercased.
/// CJK ideographs and kana survive since `\w` is Unicode-aware.
pub fn normalize_name(name: &str) -> String {
    let stripped = PUNCTUATION.replace_all(name, "");
    WHITESPACE.replace_all(&stripped, "").to_lowercase()
}

/// Truncate text to at most `max` grapheme clusters, appending an ellipsis when cut.
pub fn truncate_graphemes(text: &str, max: usize) -> String {
    let mut graphemes = text.graphemes(true);
    let head: String = graphemes.by_ref().take(max).collect();
    if graphemes.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Whether a directory name is a store folder (all ASCII digits).
pub fn is_folder_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}
