//! # logpipe
//!
//! A low-overhead structured logging engine with per-domain loggers.
//!
//! ## Features
//!
//! - **Synchronous or background writing**: inline on the caller's thread, or
//!   through one writer thread per physical log file
//! - **Shared files**: loggers of different domains pointing at the same path
//!   multiplex onto one file handle and one writer
//! - **Size-based rotation**: cascading backups `name.1 .. name.N`, optionally
//!   gzip-compressed
//! - **Repeat coalescing**: bursts of identical messages collapse into a single
//!   `N times: ...` line
//! - **Log shipping**: mirror entries to a remote aggregator over TCP
//!
//! ## Example
//!
//! ```
//! use logpipe::prelude::*;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let registry = LogRegistry::new(LogConfig::default());
//! let logger = registry
//!     .get_logger(LoggerOptions::new("app").path(dir.path().join("app.log")))
//!     .unwrap();
//!
//! logger.info("ready").unwrap();
//! logpipe::warning!(logger, "disk at {}%", 91).unwrap();
//! registry.shutdown_all(false);
//! ```

pub mod appenders;
pub mod core;
pub mod macros;

pub mod prelude {
    pub use crate::appenders::{ClientConfig, Compression, RotationPolicy};
    pub use crate::core::{
        Attributes, BacklogItem, Encoding, FieldValue, LogConfig, LogEntry, LogLevel, LogRegistry,
        Logger, LoggerError, LoggerMetrics, LoggerOptions, Result,
    };
}

pub use appenders::{ClientConfig, Compression, RotationPolicy};
pub use core::{
    backlog, get_logger, log_init, logger, rotate_all, set_backlog_size, shutdown_all, Attributes,
    BacklogItem, Encoding, FieldValue, LogConfig, LogEntry, LogLevel, LogRegistry, Logger,
    LoggerError, LoggerMetrics, LoggerOptions, Result,
};
