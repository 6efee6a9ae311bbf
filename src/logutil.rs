//! Logging helpers that keep mesh-supplied text on a single log line.
//!
//! Packet payloads and completion replies are arbitrary user content; they may
//! contain newlines or control characters that would otherwise split or corrupt
//! a log record.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Other control characters are rendered as `\xNN`. Strings longer than 300
///   characters are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    preview(s, 300)
}

/// Like [`escape_log`] with a caller-chosen character cap.
pub fn preview(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Render a byte slice as lowercase hex, capped at `max` bytes (for trace logs).
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len().min(max) * 2 + 3);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > max {
        out.push_str("...");
    }
    out
}
