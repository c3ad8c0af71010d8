//! Log level definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a log entry.
///
/// The numeric values are part of the wire format and leave room between
/// levels, so they serialize as plain integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogLevel {
    NotSet = 0,
    Debug = 10,
    #[default]
    Info = 20,
    Warning = 30,
    Error = 40,
    Fatal = 50,
    Exception = 60,
    NoLog = 70,
}

impl LogLevel {
    /// Alias kept for callers that think in terms of "critical"
    pub const CRITICAL: LogLevel = LogLevel::Fatal;

    pub fn to_str(&self) -> &'static str {
        match self {
            LogLevel::NotSet => "NOTSET",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
            LogLevel::Exception => "EXCEPTION",
            LogLevel::NoLog => "NOLOG",
        }
    }

    /// Numeric value of the level
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Exact conversion from a numeric level
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LogLevel::NotSet),
            10 => Some(LogLevel::Debug),
            20 => Some(LogLevel::Info),
            30 => Some(LogLevel::Warning),
            40 => Some(LogLevel::Error),
            50 => Some(LogLevel::Fatal),
            60 => Some(LogLevel::Exception),
            70 => Some(LogLevel::NoLog),
            _ => None,
        }
    }

    #[cfg(feature = "console")]
    pub fn color_code(&self) -> colored::Color {
        use colored::Color::*;
        match self {
            LogLevel::Fatal | LogLevel::Exception => BrightRed,
            LogLevel::Error => Red,
            LogLevel::Warning => BrightYellow,
            LogLevel::Info => BrightGreen,
            LogLevel::Debug | LogLevel::NotSet | LogLevel::NoLog => White,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        LogLevel::from_u8(value).ok_or_else(|| format!("Invalid log level value: {}", value))
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NOTSET" => Ok(LogLevel::NotSet),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" | "CRITICAL" => Ok(LogLevel::Fatal),
            "EXCEPTION" => Ok(LogLevel::Exception),
            "NOLOG" => Ok(LogLevel::NoLog),
            _ => Err(format!("Invalid log level: '{}'", s)),
        }
    }
}
