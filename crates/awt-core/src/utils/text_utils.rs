//! Efficient text processing utilities

use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

/// Case-insensitive text operations without allocation when possible
pub struct TextUtils;

impl TextUtils {
    /// Check if text contains pattern (case-insensitive)
    pub fn contains_ignore_case(text: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return true;
        }
        if pattern.len() > text.len() {
            return false;
        }
        text.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Normalize whitespace efficiently
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Count words without allocation
    pub fn count_words(text: &str) -> usize {
        text.split_whitespace().count()
    }

    /// Truncate to at most `max_chars`, cutting at the nearest word boundary
    /// and appending an ellipsis. Byte-length based; inputs are expected to
    /// be mostly ASCII chat text, and the cut is backed off to a char
    /// boundary before slicing.
    pub fn truncate_at_word(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.len() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars <= 3 {
            return Cow::Borrowed("...");
        }

        let mut cut = max_chars - 3;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }

        // Back off to the last whitespace inside the window, if any.
        let window = &text[..cut];
        let boundary = window.rfind(char::is_whitespace).unwrap_or(cut);
        let boundary = if boundary == 0 { cut } else { boundary };

        let mut result = String::with_capacity(boundary + 3);
        result.push_str(text[..boundary].trim_end());
        result.push_str("...");
        Cow::Owned(result)
    }

    /// Hard truncation without word-boundary handling, for response bodies
    /// and log capture.
    pub fn truncate_hard(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.len() <= max_chars {
            return Cow::Borrowed(text);
        }
        let mut cut = max_chars;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        Cow::Borrowed(&text[..cut])
    }
}
