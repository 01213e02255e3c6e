//! Helpers for keeping serial noise readable in logs.
//!
//! Device output is untrusted: it can contain control bytes, stray line breaks, or kilobytes
//! of garbage after a baud mismatch. Everything raw that reaches a log line goes through
//! one of these helpers so records stay single-line and bounded.
use std::fmt::Write;

const MAX_PREVIEW_CHARS: usize = 120;

/// Escape control characters and cap the length of a text fragment:
/// - `\r`, `\n`, `\t` become their two-character escapes
/// - other control characters become `\xNN`
/// - anything past the preview limit is replaced by a single `…`
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW_CHARS) + 4);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW_CHARS {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Hex dump of at most `max` leading bytes, for trace logging of raw reads.
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(data.len().min(max) * 2 + 4);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > max {
        out.push('…');
    }
    out
}
