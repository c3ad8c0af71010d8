//! Log entry structure

use super::attributes::Attributes;
use super::log_level::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One log record.
///
/// Entries are immutable once created; every pipeline stage (coalescing,
/// formatting, backlog, shipping) works on the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since the Unix epoch
    pub time: f64,
    pub domain: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attrs: Attributes,
}

impl LogEntry {
    pub fn new(domain: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: now_seconds(),
            domain: domain.into(),
            level,
            message: message.into(),
            attrs: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }
}

/// Current wall-clock time as fractional seconds
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
