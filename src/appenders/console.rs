//! Console output for formatted lines and engine diagnostics
//!
//! Lines at ERROR and above go to stderr, everything else to stdout. With
//! the `console` feature and colors enabled, lines are tinted per level or
//! per the entry's `color` attribute.

use crate::core::{LogEntry, LogLevel};

#[cfg(feature = "console")]
use colored::{Color, Colorize};

/// Where a line of the given level is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn for_level(level: LogLevel) -> Self {
        if level >= LogLevel::Error {
            Stream::Stderr
        } else {
            Stream::Stdout
        }
    }
}

/// Print one formatted line for `entry`
pub fn print(entry: &LogEntry, line: &str, colors: bool) {
    let output = paint(entry, line, colors);
    match Stream::for_level(entry.level) {
        Stream::Stderr => eprintln!("{}", output),
        Stream::Stdout => println!("{}", output),
    }
}

#[cfg(feature = "console")]
fn paint(entry: &LogEntry, line: &str, colors: bool) -> String {
    if !colors {
        return line.to_string();
    }
    let color = entry
        .attrs
        .color()
        .map(Color::from)
        .unwrap_or_else(|| entry.level.color_code());
    line.color(color).to_string()
}

#[cfg(not(feature = "console"))]
fn paint(_entry: &LogEntry, line: &str, _colors: bool) -> String {
    line.to_string()
}

/// Print an engine failure to stderr
pub(crate) fn print_error(message: &str, colors: bool) {
    let line = format!("[LOGGER ERROR] {}", message);
    #[cfg(feature = "console")]
    if colors {
        eprintln!("{}", line.bright_red());
        return;
    }
    let _ = colors;
    eprintln!("{}", line);
}
