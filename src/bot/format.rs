//! Reply length budget.
//!
//! Lengths are counted in Unicode scalar values, so a cut never lands inside a
//! character. The radio payload limit is in bytes; the configured budget is
//! expected to leave headroom for multi-byte text.

pub const TRUNCATION_MARKER: &str = "...";
pub const GENERIC_ERROR: &str = "AI Error: Unable to process request";

/// Fit `text` into `max_len` characters, marking a cut with `...`.
pub fn shape(text: &str, max_len: usize) -> String {
    let count = text.chars().count();
    if count <= max_len {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_len <= marker_len {
        return text.chars().take(max_len).collect();
    }
    let mut out: String = text.chars().take(max_len - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Error text if it fits, otherwise the generic error message (itself shaped).
pub fn shape_error(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        shape(GENERIC_ERROR, max_len)
    }
}
