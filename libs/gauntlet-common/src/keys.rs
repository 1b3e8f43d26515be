use chrono::{DateTime, Utc};

/// Object-store key semantics - defines only naming, not transfer logic.
/// Keeps the API, the worker and the CLI from drifting on where results land.

pub const DEFAULT_RESULTS_PREFIX: &str = "results";
pub const RESULT_FILE_NAME: &str = "results.json";

/// Make a caller-supplied label safe to use as a single key segment.
/// Whitespace and path separators become `_`.
pub fn sanitize_segment(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "anonymous".to_string(),
        _ => cleaned,
    }
}

/// Deterministic result key for a display name and timestamp.
pub fn result_key(prefix: &str, display_name: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}/{}",
        prefix.trim_end_matches('/'),
        sanitize_segment(display_name),
        timestamp.timestamp(),
        RESULT_FILE_NAME
    )
}

/// File name of the integrity marker that sits next to a cached dataset.
pub fn marker_file_name(dataset_name: &str) -> String {
    format!("{}.ready.json", dataset_name)
}
