//! Logging macros with `format!`-style interpolation.
//!
//! A message given without arguments is passed through verbatim, so braces
//! in it need no escaping. With arguments it is formatted with `format!`.
//! The level macros check the logger's threshold before formatting.
//!
//! # Examples
//!
//! ```
//! use logpipe::prelude::*;
//! use logpipe::info;
//!
//! let registry = LogRegistry::new(LogConfig::default());
//! let logger = registry.get_logger(LoggerOptions::new("app")).unwrap();
//!
//! info!(logger, "Server started").unwrap();
//! let port = 8080;
//! info!(logger, "Server listening on port {}", port).unwrap();
//! info!(logger, "literal {braces} stay as they are").unwrap();
//! ```

/// Log at any level, ignoring the logger's threshold.
///
/// # Examples
///
/// ```
/// # use logpipe::prelude::*;
/// # let registry = LogRegistry::new(LogConfig::default());
/// # let logger = registry.get_logger(LoggerOptions::new("app")).unwrap();
/// use logpipe::log;
/// log!(logger, LogLevel::Info, "Simple message").unwrap();
/// log!(logger, LogLevel::Error, "Error code: {}", 500).unwrap();
/// ```
#[macro_export]
macro_rules! log {
    ($logger:expr, $level:expr, $msg:expr) => {
        $logger.log($level, $msg)
    };
    ($logger:expr, $level:expr, $fmt:literal, $($arg:tt)+) => {
        $logger.log($level, format!($fmt, $($arg)+))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_gated {
    ($logger:expr, $level:expr, $($arg:tt)+) => {{
        let logger = &$logger;
        if logger.is_enabled($level) {
            $crate::log!(logger, $level, $($arg)+)
        } else {
            ::std::result::Result::<(), $crate::LoggerError>::Ok(())
        }
    }};
}

/// Log a debug-level message.
#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => {
        $crate::__log_gated!($logger, $crate::LogLevel::Debug, $($arg)+)
    };
}

/// Log an info-level message.
#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)+) => {
        $crate::__log_gated!($logger, $crate::LogLevel::Info, $($arg)+)
    };
}

/// Log a warning-level message.
///
/// # Examples
///
/// ```
/// # use logpipe::prelude::*;
/// # let registry = LogRegistry::new(LogConfig::default());
/// # let logger = registry.get_logger(LoggerOptions::new("app")).unwrap();
/// use logpipe::warning;
/// warning!(logger, "Low disk space").unwrap();
/// warning!(logger, "Retry attempt {} of {}", 3, 5).unwrap();
/// ```
#[macro_export]
macro_rules! warning {
    ($logger:expr, $($arg:tt)+) => {
        $crate::__log_gated!($logger, $crate::LogLevel::Warning, $($arg)+)
    };
}

/// Log an error-level message.
#[macro_export]
macro_rules! error {
    ($logger:expr, $($arg:tt)+) => {
        $crate::__log_gated!($logger, $crate::LogLevel::Error, $($arg)+)
    };
}

/// Log a fatal-level message.
#[macro_export]
macro_rules! fatal {
    ($logger:expr, $($arg:tt)+) => {
        $crate::__log_gated!($logger, $crate::LogLevel::Fatal, $($arg)+)
    };
}

/// Log at EXCEPTION level with the current stack trace attached.
///
/// # Examples
///
/// ```
/// # use logpipe::prelude::*;
/// # let registry = LogRegistry::new(LogConfig::default());
/// # let logger = registry.get_logger(LoggerOptions::new("app")).unwrap();
/// use logpipe::exception;
/// exception!(logger, "Unable to recover from error: {}", "disk full").unwrap();
/// ```
#[macro_export]
macro_rules! exception {
    ($logger:expr, $msg:expr) => {
        $logger.exception($msg)
    };
    ($logger:expr, $fmt:literal, $($arg:tt)+) => {{
        let logger = &$logger;
        if logger.is_enabled($crate::LogLevel::Exception) {
            logger.exception(format!($fmt, $($arg)+))
        } else {
            ::std::result::Result::<(), $crate::LoggerError>::Ok(())
        }
    }};
}

#[cfg(test)]
mod tests {
    use crate::core::{LogConfig, LogLevel, LogRegistry, LoggerOptions};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_macros_format_only_with_arguments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("macros.log");
        let config = LogConfig::builder().formatter(|e| e.message.clone()).build().unwrap();
        let registry = LogRegistry::new(config);
        let logger = registry
            .get_logger(LoggerOptions::new("m").path(&path).level(LogLevel::Debug))
            .unwrap();

        log!(logger, LogLevel::Info, "raw {braces}").unwrap();
        info!(logger, "count: {}", 5).unwrap();
        debug!(logger, "debug").unwrap();
        warning!(logger, "{}-{}", "a", "b").unwrap();
        error!(logger, "Code: {}", 500).unwrap();
        fatal!(logger, "Fatal message").unwrap();
        registry.shutdown_all(false);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec!["raw {braces}", "count: 5", "debug", "a-b", "Code: 500", "Fatal message"]
        );
    }

    #[test]
    fn test_gated_macro_skips_formatting() {
        struct Loud;
        impl std::fmt::Display for Loud {
            fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                panic!("formatted below threshold");
            }
        }

        let registry = LogRegistry::new(LogConfig::default());
        let logger = registry.get_logger(LoggerOptions::new("quiet")).unwrap();
        debug!(logger, "value {}", Loud).unwrap();
        assert_eq!(logger.metrics().emitted(), 0);
    }
}
