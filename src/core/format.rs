//! Line formatting for log entries
//!
//! The default text layout is `<local time> <LEVEL>: <message>`, followed by
//! the exception trace on the next lines when the entry carries `exc_info`.
//! A JSON-lines formatter is available for use as the formatter hook.

use super::config::{FormatterFn, LogConfig};
use super::log_entry::LogEntry;
use chrono::{DateTime, Local, TimeZone, Utc};
use std::sync::Arc;

/// Convert fractional epoch seconds to a local timestamp
pub fn local_time(time: f64) -> DateTime<Local> {
    let secs = time.floor();
    let nanos = ((time - secs) * 1_000_000_000.0).round().min(999_999_999.0) as u32;
    Local
        .timestamp_opt(secs as i64, nanos)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH.with_timezone(&Local))
}

/// Default text layout
pub fn format_text(entry: &LogEntry, time_format: &str) -> String {
    let time = local_time(entry.time).format(time_format);
    match entry.attrs.exc_info() {
        Some(trace) => format!("{} {}: {}\n{}", time, entry.level.to_str(), entry.message, trace),
        None => format!("{} {}: {}", time, entry.level.to_str(), entry.message),
    }
}

/// Render an entry with the configured formatter hook or the default layout
pub(crate) fn render(config: &LogConfig, entry: &LogEntry) -> String {
    match config.formatter {
        Some(ref formatter) => formatter(entry),
        None => format_text(entry, &config.time_format),
    }
}

/// Prefix a rendered line with its repeat count
pub(crate) fn with_repeat_count(line: String, count: u32) -> String {
    if count > 0 {
        format!("{} times: {}", count, line)
    } else {
        line
    }
}

/// One JSON object per line: time, domain, level symbol, message, attributes
///
/// # Example
/// ```
/// use logpipe::prelude::*;
/// use logpipe::core::format::json_formatter;
///
/// let config = LogConfig::builder().formatter_fn(json_formatter()).build().unwrap();
/// # let _ = config;
/// ```
pub fn json_formatter() -> FormatterFn {
    Arc::new(|entry: &LogEntry| {
        let mut json_obj = serde_json::Map::new();
        json_obj.insert("time".to_string(), serde_json::json!(entry.time));
        json_obj.insert(
            "domain".to_string(),
            serde_json::Value::String(entry.domain.clone()),
        );
        json_obj.insert(
            "level".to_string(),
            serde_json::Value::String(entry.level.to_str().to_string()),
        );
        json_obj.insert(
            "message".to_string(),
            serde_json::Value::String(entry.message.clone()),
        );
        for (key, value) in entry.attrs.iter() {
            json_obj.insert(
                key.clone(),
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::to_string(&serde_json::Value::Object(json_obj)).unwrap_or_default()
    })
}
