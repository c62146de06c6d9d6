//! Time and text helpers shared across the workspace.

use chrono::{SecondsFormat, Utc};

/// Current time as an RFC3339 UTC string with millisecond precision.
///
/// All user-visible timestamps in the control plane go through this helper
/// so they are unambiguous about their zone.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time as whole seconds since the Unix epoch.
pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Collapse a (possibly multi-line) backend error into one trimmed line.
pub fn single_line(text: &str) -> String {
    match text.split(['\n', '\r']).find(|l| !l.trim().is_empty()) {
        Some(line) => line.trim().to_string(),
        None => String::new(),
    }
}
