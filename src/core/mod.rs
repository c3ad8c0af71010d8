//! Core logger types: entries, configuration, the logger pipeline and the
//! domain registry

pub mod attributes;
pub mod backlog;
pub mod coalescing;
pub mod config;
pub mod error;
pub mod format;
pub mod log_entry;
pub mod log_level;
pub mod logger;
pub mod metrics;
pub mod registry;
pub(crate) mod shared_file;
pub(crate) mod writer;

pub use attributes::{Attributes, FieldValue};
pub use backlog::{Backlog, BacklogItem};
pub use coalescing::{Coalesced, CoalescingState, Offer};
pub use config::{
    Encoding, FormatterFn, LogConfig, LogConfigBuilder, MessageKeyFn, WriterFn,
    DEFAULT_FLUSH_THRESHOLD, DEFAULT_SAME_MSG_TIMEOUT, DEFAULT_TIME_FORMAT,
};
pub use error::{LoggerError, Result};
pub use log_entry::LogEntry;
pub use log_level::LogLevel;
pub use logger::{Logger, LoggerOptions, ROOT_DOMAIN};
pub use metrics::LoggerMetrics;
pub use registry::{
    backlog, get_logger, log_init, logger, rotate_all, set_backlog_size, shutdown_all, LogRegistry,
};
