//! Logging helpers for subprocess output. The `meshtastic` CLI prints banners, progress
//! dots and multi-line JSON; these helpers keep every log record on a single line.

/// Default cap on the number of characters a probe preview may occupy in a log line.
pub const PROBE_PREVIEW_CHARS: usize = 300;

/// Escape a string for single-line logging, capped at [`PROBE_PREVIEW_CHARS`].
pub fn escape_log(s: &str) -> String {
    escape_log_capped(s, PROBE_PREVIEW_CHARS)
}

/// Escape control characters (`\n`, `\r`, `\t`, backslash, other controls as `\xNN`)
/// and truncate after `max_chars` characters with an ellipsis.
pub fn escape_log_capped(s: &str, max_chars: usize) -> String {
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

/// Last non-empty line of a subprocess stream, escaped. The CLI reports its actual
/// error after a trace dump, so the tail is what an operator wants to see.
pub fn last_line(s: &str) -> String {
    s.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(escape_log)
        .unwrap_or_default()
}
