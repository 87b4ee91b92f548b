pub mod observations;
pub mod registry;
pub mod sessions;
pub mod stats;
pub mod types;

use chrono::{SecondsFormat, Utc};

/// Failed embedding attempts after which a row leaves the worker's backlog.
pub const MAX_EMBED_ATTEMPTS: u32 = 3;

/// RFC 3339 UTC timestamp with microsecond precision.
///
/// Fixed width, so lexical order in SQLite matches chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Timestamp `days` before now, in the same format as [`now_timestamp`].
pub fn timestamp_days_ago(days: u64) -> String {
    // Capped well inside chrono's representable range.
    let days = days.min(365_000) as i64;
    let cutoff = Utc::now()
        .checked_sub_signed(chrono::Duration::days(days))
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    cutoff.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Truncate content to max_chars, appending "..." if truncated.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((end, _)) => format!("{}...", &content[..end]),
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
