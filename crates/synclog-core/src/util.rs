//! Shared utility functions used across multiple modules.

/// Normalise a relative path: `/` separators, no empty segments, no
/// leading or trailing separator.
pub fn normalize_relative_path(path: &str) -> String {
    split_path(path).join("/")
}

/// Split a path into its non-empty segments. Both `/` and `\` separate.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}

/// Split a path into its parent path and final name.
///
/// Returns `None` for an empty path.
pub fn split_parent(path: &str) -> Option<(String, String)> {
    let mut segments = split_path(path);
    let name = segments.pop()?.to_string();
    Some((segments.join("/"), name))
}

/// Join a normalised parent path with a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Whether `path` equals `prefix` or lies below it, comparing whole segments.
pub fn is_within(prefix: &str, path: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
