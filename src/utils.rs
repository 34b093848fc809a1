use crate::error::{ExportError, ExportResult};
use std::time::Duration;
use url::Url;

/// Make a caller-supplied filename safe for a `Content-Disposition` header.
///
/// Quotes, path separators and control characters become `_`. An empty
/// result falls back to `fallback`.
pub fn sanitize_filename(input: &str, fallback: &str) -> String {
    let cleaned = input
        .chars()
        .map(|c| match c {
            '/' | '\\' | '"' | ':' | '*' | '?' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        fallback.to_string()
    } else {
        cleaned
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Parse an export target. Any absolute URL is accepted; the browser decides
/// what it can load.
pub fn validate_url(url: &str) -> ExportResult<Url> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ExportError::MissingUrl);
    }

    Url::parse(trimmed).map_err(|e| ExportError::InvalidUrl(format!("{trimmed}: {e}")))
}

/// Query flags are true unless present and something other than `true`.
pub fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(v) => v.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
