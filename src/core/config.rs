//! Process-wide logging configuration
//!
//! A [`LogConfig`] is built once at initialization and shared as
//! `Arc<LogConfig>` by every logger and writer thread created from it.
//! Nothing in it changes after construction.

use super::error::{LoggerError, Result};
use super::log_entry::LogEntry;
use crate::appenders::file::FlushContext;
use crate::appenders::rotating_file::Compression;
use chrono::format::{Item, StrftimeItems};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Derives the coalescing key of an entry (default: the message text)
pub type MessageKeyFn = Arc<dyn Fn(&LogEntry) -> String + Send + Sync>;

/// Renders an entry into a single output line (without trailing newline)
pub type FormatterFn = Arc<dyn Fn(&LogEntry) -> String + Send + Sync>;

/// Replaces the final write of buffered bytes to the log file
pub type WriterFn = Arc<dyn Fn(&mut FlushContext<'_>) -> std::io::Result<()> + Send + Sync>;

/// Default time format of the text formatter
pub const DEFAULT_TIME_FORMAT: &str = "%H:%M:%S";

/// Buffered bytes that trigger a flush in background-writer mode
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4096;

/// Default window for collapsing identical messages
pub const DEFAULT_SAME_MSG_TIMEOUT: Duration = Duration::from_secs(30);

/// Character encoding of the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

impl Encoding {
    /// Encode a line, replacing characters the encoding cannot express with `?`
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

impl FromStr for Encoding {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Encoding::Latin1),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            other => Err(LoggerError::config(
                "LogConfig",
                format!("unsupported encoding '{}'", other),
            )),
        }
    }
}

/// Immutable engine configuration
#[derive(Clone)]
pub struct LogConfig {
    pub(crate) message_key: Option<MessageKeyFn>,
    pub(crate) formatter: Option<FormatterFn>,
    pub(crate) writer: Option<WriterFn>,
    pub(crate) colors: bool,
    pub(crate) compression: Option<Compression>,
    pub(crate) use_background_writer: bool,
    pub(crate) encoding: Encoding,
    pub(crate) same_msg_timeout: Duration,
    pub(crate) same_msg_count_max: u32,
    pub(crate) time_format: String,
    pub(crate) flush_threshold: usize,
}

impl LogConfig {
    #[must_use]
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::new()
    }

    pub fn colors(&self) -> bool {
        self.colors
    }

    pub fn use_background_writer(&self) -> bool {
        self.use_background_writer
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn compression(&self) -> Option<&Compression> {
        self.compression.as_ref()
    }

    pub fn same_msg_timeout(&self) -> Duration {
        self.same_msg_timeout
    }

    pub fn same_msg_count_max(&self) -> u32 {
        self.same_msg_count_max
    }

    /// Whether identical messages are collapsed at all
    pub fn coalescing_enabled(&self) -> bool {
        self.same_msg_count_max > 0
    }

    pub fn time_format(&self) -> &str {
        &self.time_format
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Coalescing key for an entry
    pub(crate) fn message_key(&self, entry: &LogEntry) -> String {
        match self.message_key {
            Some(ref key_fn) => key_fn(entry),
            None => entry.message.clone(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            message_key: None,
            formatter: None,
            writer: None,
            colors: false,
            compression: None,
            use_background_writer: false,
            encoding: Encoding::Utf8,
            same_msg_timeout: DEFAULT_SAME_MSG_TIMEOUT,
            same_msg_count_max: 0,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConfig")
            .field("message_key", &self.message_key.is_some())
            .field("formatter", &self.formatter.is_some())
            .field("writer", &self.writer.is_some())
            .field("colors", &self.colors)
            .field("compression", &self.compression)
            .field("use_background_writer", &self.use_background_writer)
            .field("encoding", &self.encoding)
            .field("same_msg_timeout", &self.same_msg_timeout)
            .field("same_msg_count_max", &self.same_msg_count_max)
            .field("time_format", &self.time_format)
            .field("flush_threshold", &self.flush_threshold)
            .finish()
    }
}

/// Builder for [`LogConfig`]
///
/// # Example
/// ```
/// use logpipe::prelude::*;
/// use std::time::Duration;
///
/// let config = LogConfig::builder()
///     .background_writer(true)
///     .same_msg_count_max(10)
///     .same_msg_timeout(Duration::from_secs(5))
///     .compression(Compression::gzip())
///     .build()
///     .unwrap();
/// assert!(config.coalescing_enabled());
/// ```
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
    encoding: Option<String>,
}

impl LogConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom coalescing key derivation
    #[must_use = "builder methods return a new value"]
    pub fn message_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&LogEntry) -> String + Send + Sync + 'static,
    {
        self.config.message_key = Some(Arc::new(key_fn));
        self
    }

    /// Custom line formatter
    #[must_use = "builder methods return a new value"]
    pub fn formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&LogEntry) -> String + Send + Sync + 'static,
    {
        self.config.formatter = Some(Arc::new(formatter));
        self
    }

    /// Shared formatter, e.g. [`crate::core::format::json_formatter`]
    #[must_use = "builder methods return a new value"]
    pub fn formatter_fn(mut self, formatter: FormatterFn) -> Self {
        self.config.formatter = Some(formatter);
        self
    }

    /// Custom write of buffered bytes
    #[must_use = "builder methods return a new value"]
    pub fn writer<F>(mut self, writer: F) -> Self
    where
        F: Fn(&mut FlushContext<'_>) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.config.writer = Some(Arc::new(writer));
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn colors(mut self, enabled: bool) -> Self {
        self.config.colors = enabled;
        self
    }

    /// Compress rotated backups
    #[must_use = "builder methods return a new value"]
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = Some(compression);
        self
    }

    /// Write through one background thread per log file
    #[must_use = "builder methods return a new value"]
    pub fn background_writer(mut self, enabled: bool) -> Self {
        self.config.use_background_writer = enabled;
        self
    }

    /// Encoding name, validated by `build()`
    #[must_use = "builder methods return a new value"]
    pub fn encoding(mut self, name: impl Into<String>) -> Self {
        self.encoding = Some(name.into());
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn same_msg_timeout(mut self, timeout: Duration) -> Self {
        self.config.same_msg_timeout = timeout;
        self
    }

    /// Maximum repeat count collapsed into one line; 0 disables coalescing
    #[must_use = "builder methods return a new value"]
    pub fn same_msg_count_max(mut self, count: u32) -> Self {
        self.config.same_msg_count_max = count;
        self
    }

    /// strftime-compatible time format of the default formatter
    #[must_use = "builder methods return a new value"]
    pub fn time_format(mut self, format: impl Into<String>) -> Self {
        self.config.time_format = format.into();
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn flush_threshold(mut self, bytes: usize) -> Self {
        self.config.flush_threshold = bytes;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<LogConfig> {
        let mut config = self.config;
        if let Some(name) = self.encoding {
            config.encoding = name.parse()?;
        }
        if config.coalescing_enabled() && config.same_msg_timeout.is_zero() {
            return Err(LoggerError::config(
                "LogConfig",
                "same_msg_timeout must be positive when coalescing is enabled",
            ));
        }
        if StrftimeItems::new(&config.time_format).any(|item| matches!(item, Item::Error)) {
            return Err(LoggerError::config(
                "LogConfig",
                format!("invalid time_format '{}'", config.time_format),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LogLevel;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert!(!config.use_background_writer());
        assert!(!config.coalescing_enabled());
        assert_eq!(config.same_msg_timeout(), Duration::from_secs(30));
        assert_eq!(config.flush_threshold(), 4096);
        assert_eq!(config.time_format(), "%H:%M:%S");
    }

    #[test]
    fn test_encoding_parse() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("latin_1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!("ebcdic".parse::<Encoding>().is_err());
        assert!(LogConfig::builder().encoding("koi8").build().is_err());
    }

    #[test]
    fn test_encoding_replaces_unencodable() {
        assert_eq!(Encoding::Latin1.encode("café €"), b"caf\xe9 ?".to_vec());
        assert_eq!(Encoding::Ascii.encode("café"), b"caf?".to_vec());
        assert_eq!(Encoding::Utf8.encode("é"), "é".as_bytes().to_vec());
    }

    #[test]
    fn test_message_key_hook() {
        let config = LogConfig::builder()
            .message_key(|entry| entry.message.split(':').next().unwrap_or("").to_string())
            .build()
            .unwrap();
        let entry = LogEntry::new("net", LogLevel::Error, "timeout: peer 7");
        assert_eq!(config.message_key(&entry), "timeout");
    }

    #[test]
    fn test_invalid_time_format_rejected() {
        assert!(LogConfig::builder().time_format("%Q").build().is_err());
        assert!(LogConfig::builder().time_format("%Y-%m-%d %H:%M:%S%.3f").build().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected_with_coalescing() {
        let result = LogConfig::builder()
            .same_msg_count_max(3)
            .same_msg_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }
}
