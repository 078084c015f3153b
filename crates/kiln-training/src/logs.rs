use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default per-job log retention.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// One entry in a job's log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self { timestamp: Utc::now(), level, message: message.into(), data }
    }
}

/// Fixed-capacity, append-only log that drops its oldest entries once full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedLog {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl BoundedLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: VecDeque::new() }
    }

    /// Appends an entry, evicting the oldest one if the log is at capacity.
    pub fn push(&mut self, entry: LogEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Returns up to the `limit` most recent entries, oldest first,
    /// optionally filtered by level.
    #[must_use]
    pub fn tail(&self, level: Option<LogLevel>, limit: usize) -> Vec<LogEntry> {
        let mut out: Vec<LogEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| level.is_none_or(|l| e.level == l))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}

impl Default for BoundedLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
