//! Text sanitization ahead of speech synthesis
//!
//! Strips the things a voice should never read aloud: URLs, Markdown
//! markup, typographic quotes and brackets, runaway ellipses. The text
//! is NFKC-normalized first so compatibility forms (fullwidth letters,
//! the ellipsis character) collapse to their plain equivalents.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("url pattern"));
static MARKDOWN_MARKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[*_`~#]+").expect("markdown pattern"));
static DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{3,}").expect("dots pattern"));
static QUOTES_BRACKETS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[“”„«»"\[\]\{\}\(\)<>]"#).expect("quote pattern"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws pattern"));
static SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([.,!?;:])").expect("punct pattern"));

/// Clean `text` for the synthesizer.
pub fn sanitize(text: &str) -> String {
    // NFKC also folds U+2026 (…) into three dots.
    let text: String = text.nfkc().collect();
    let text = text.replace(['\u{2018}', '\u{2019}'], "'");
    let text = URL.replace_all(&text, " ");
    let text = MARKDOWN_MARKS.replace_all(&text, "");
    let text = DOTS.replace_all(&text, ".");
    let text = QUOTES_BRACKETS.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(&text, " ");
    let text = SPACE_BEFORE_PUNCT.replace_all(&text, "$1");
    text.trim().to_string()
}
