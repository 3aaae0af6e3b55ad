//! Bounded per-node log surface
//!
//! Every node keeps the last 100 log entries for the embedding UI.
//! Transient problems appear as warnings, persistent ones as errors.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum entries retained per node
pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Ring of the most recent entries for one node.
#[derive(Default)]
pub struct NodeLog {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl NodeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            ts: Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_bounded_at_capacity() {
        let log = NodeLog::new();
        for i in 0..150 {
            log.info(format!("entry {}", i));
        }
        let entries = log.snapshot();
        assert_eq!(entries.len(), LOG_CAPACITY);
        assert_eq!(entries[0].message, "entry 50");
        assert_eq!(entries.last().unwrap().message, "entry 149");
    }

    #[test]
    fn test_levels_recorded() {
        let log = NodeLog::new();
        log.warn("careful");
        log.error("broken");
        let entries = log.snapshot();
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[1].level, LogLevel::Error);
    }
}
