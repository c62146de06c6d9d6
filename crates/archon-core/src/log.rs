//! Bounded in-process log rings with subscriber fan-out.
//!
//! Each supervised instance (and the supervisor itself) keeps the most
//! recent [`LOG_RING_CAPACITY`] entries in memory for tailing. A broadcast
//! channel fans appended entries out to live subscribers (the log-stream
//! WebSocket); slow subscribers lag and skip, they never block the producer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::utils::now_rfc3339;

/// Maximum entries retained per ring.
pub const LOG_RING_CAPACITY: usize = 1000;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Routine information
    Info,
    /// Unexpected but recoverable
    Warning,
    /// Operation failed
    Error,
    /// Unrecoverable failure
    Critical,
}

impl LogLevel {
    /// Guess the level of a raw container log line from its content.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if ["error", "exception", "failed", "critical"]
            .iter()
            .any(|w| lower.contains(w))
        {
            Self::Error
        } else if lower.contains("warning") || lower.contains("warn") {
            Self::Warning
        } else if lower.contains("debug") {
            Self::Debug
        } else {
            Self::Info
        }
    }
}

/// One log record: RFC3339 UTC timestamp, level, message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC3339 UTC timestamp
    pub timestamp: String,
    /// Entry severity
    pub level: LogLevel,
    /// Log message
    pub message: String,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: now_rfc3339(),
            level,
            message: message.into(),
        }
    }

    /// Create an entry with an explicit timestamp (container log lines carry
    /// their own).
    pub fn at(timestamp: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            level,
            message: message.into(),
        }
    }
}

/// Bounded append-only ring of log entries.
///
/// Single producer, many consumers: appends evict the oldest entry once the
/// ring is full, and each append is also broadcast to subscribers.
#[derive(Debug)]
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    fanout: broadcast::Sender<LogEntry>,
}

impl LogRing {
    /// Create a ring with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(LOG_RING_CAPACITY)
    }

    /// Create a ring with an explicit capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            fanout,
        }
    }

    /// Append an entry, evicting the oldest on overflow.
    pub fn push(&self, entry: LogEntry) {
        {
            let mut entries = self.entries.lock();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        // Fan-out is best effort; no subscribers is the common case.
        let _ = self.fanout.send(entry);
    }

    /// Convenience: stamp and append a message at the given level.
    pub fn record(&self, level: LogLevel, message: impl Into<String>) {
        self.push(LogEntry::new(level, message));
    }

    /// The most recent `limit` entries, oldest first. A zero limit returns
    /// everything retained.
    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = if limit == 0 || limit >= entries.len() {
            0
        } else {
            entries.len() - limit
        };
        entries.iter().skip(skip).cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Discard all retained entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Subscribe to live appends. Each subscriber observes a monotonic
    /// prefix; lagging subscribers skip ahead rather than block appends.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.fanout.subscribe()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_level_classification() {
        assert_eq!(LogLevel::classify("connection failed"), LogLevel::Error);
        assert_eq!(LogLevel::classify("Traceback: exception"), LogLevel::Error);
        assert_eq!(LogLevel::classify("WARN: slow request"), LogLevel::Warning);
        assert_eq!(LogLevel::classify("debug: frame in"), LogLevel::Debug);
        assert_eq!(LogLevel::classify("server listening"), LogLevel::Info);
    }

    #[test]
    fn test_level_serde_uppercase() {
        assert_eq!(serde_json::to_string(&LogLevel::Warning).unwrap(), "\"WARNING\"");
        let parsed: LogLevel = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(parsed, LogLevel::Critical);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = LogRing::with_capacity(3);
        for i in 0..5 {
            ring.record(LogLevel::Info, format!("entry {i}"));
        }
        let tail = ring.tail(0);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "entry 2");
        assert_eq!(tail[2].message, "entry 4");
    }

    #[test]
    fn test_tail_limit() {
        let ring = LogRing::new();
        for i in 0..10 {
            ring.record(LogLevel::Info, format!("entry {i}"));
        }
        let tail = ring.tail(4);
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0].message, "entry 6");
        assert_eq!(tail[3].message, "entry 9");
        assert_eq!(ring.tail(100).len(), 10);
    }

    #[test]
    fn test_clear() {
        let ring = LogRing::new();
        ring.record(LogLevel::Info, "one");
        assert!(!ring.is_empty());
        ring.clear();
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn test_fanout_subscribers_see_appends() {
        let ring = LogRing::new();
        let mut rx = ring.subscribe();
        ring.record(LogLevel::Warning, "fan me out");
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.message, "fan me out");
    }
}
