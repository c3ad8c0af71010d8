//! Size-based rotation of log files
//!
//! When the active file reaches its size limit it is closed, existing
//! backups are shifted one slot up (`name.1` -> `name.2`, ...), the closed
//! file becomes `name.1` (optionally compressed) and a fresh `name` is
//! opened. The oldest backup beyond the configured count is overwritten.

use crate::core::error::{LoggerError, Result};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size limit and backup count of a log file
///
/// # Examples
///
/// ```
/// use logpipe::appenders::RotationPolicy;
///
/// let policy = RotationPolicy::new(10 * 1024 * 1024, 5).unwrap();
/// assert!(policy.is_enabled());
///
/// // A size limit without backups has nowhere to rotate to
/// assert!(RotationPolicy::new(1024, 0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationPolicy {
    max_size: u64,
    backup_count: u32,
}

impl RotationPolicy {
    /// Validate a size limit / backup count pair
    ///
    /// Both must be zero (no rotation) or both non-zero.
    pub fn new(max_size: u64, backup_count: u32) -> Result<Self> {
        if max_size > 0 && backup_count == 0 {
            return Err(LoggerError::config(
                "RotationPolicy",
                format!("max_size {} requires a non-zero backup_count", max_size),
            ));
        }
        if max_size == 0 && backup_count > 0 {
            return Err(LoggerError::config(
                "RotationPolicy",
                format!("backup_count {} requires a non-zero max_size", backup_count),
            ));
        }
        Ok(Self {
            max_size,
            backup_count,
        })
    }

    /// Never rotate
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    #[must_use]
    pub fn backup_count(&self) -> u32 {
        self.backup_count
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    /// Rotation is due once the written position reaches the limit
    #[must_use]
    pub fn is_due(&self, written: u64) -> bool {
        self.is_enabled() && written >= self.max_size
    }

    /// Appending `size` bytes to a non-empty file would cross the limit
    #[must_use]
    pub fn would_overflow(&self, written: u64, size: u64) -> bool {
        self.is_enabled() && written > 0 && written + size > self.max_size
    }
}

/// Compression capability for rotated backups
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Gzip compressor backed by `flate2`
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: flate2::Compression,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: flate2::Compression::default(),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::with_capacity(data.len() / 4), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }
}

/// A compressor together with the file extension of its output
#[derive(Clone)]
pub struct Compression {
    compressor: Arc<dyn Compressor>,
    extension: String,
}

impl Compression {
    /// `extension` is appended verbatim, so include the dot (".gz")
    pub fn new(compressor: Arc<dyn Compressor>, extension: impl Into<String>) -> Self {
        Self {
            compressor,
            extension: extension.into(),
        }
    }

    /// Gzip with default level, backups named `name.N.gz`
    pub fn gzip() -> Self {
        Self::new(Arc::new(GzipCompressor::default()), ".gz")
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        self.compressor.compress(data)
    }
}

impl fmt::Debug for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compression")
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

/// Outcome of a rotation; skipped backup slots are not fatal
#[derive(Debug, Default)]
pub struct RotationReport {
    pub skipped: Vec<LoggerError>,
}

/// Performs the file shuffling of one rotation
///
/// The caller must have flushed and closed the active file first and is
/// responsible for reopening it afterwards.
pub struct RotationManager<'a> {
    base_path: &'a Path,
    backup_count: u32,
    compression: Option<&'a Compression>,
}

impl<'a> RotationManager<'a> {
    pub fn new(base_path: &'a Path, backup_count: u32, compression: Option<&'a Compression>) -> Self {
        Self {
            base_path,
            backup_count,
            compression,
        }
    }

    fn extension(&self) -> &str {
        self.compression.map(Compression::extension).unwrap_or("")
    }

    /// Get backup file path for given index
    pub fn backup_path(&self, index: u32) -> PathBuf {
        backup_path(self.base_path, index, self.extension())
    }

    /// Shift backups and move the closed active file into slot 1
    ///
    /// Failures while shifting older backups are collected in the report and
    /// do not stop the rotation. Failing to move the active file is an error.
    pub fn rotate(&self) -> Result<RotationReport> {
        let mut report = RotationReport::default();

        for index in (2..=self.backup_count).rev() {
            let old_path = self.backup_path(index - 1);
            if !old_path.exists() {
                continue;
            }
            let new_path = self.backup_path(index);
            if let Err(e) = replace_file(&old_path, &new_path) {
                report.skipped.push(LoggerError::file_rotation(
                    old_path.display().to_string(),
                    format!("Failed to shift backup to '{}': {}", new_path.display(), e),
                ));
            }
        }

        if !self.base_path.exists() {
            return Ok(report);
        }

        let first_backup = self.backup_path(1);
        match self.compression {
            None => replace_file(self.base_path, &first_backup).map_err(|e| {
                LoggerError::file_rotation(
                    self.base_path.display().to_string(),
                    format!("Failed to rotate current log file: {}", e),
                )
            })?,
            Some(compression) => self.compress_into(compression, &first_backup)?,
        }

        Ok(report)
    }

    /// Compress the active file into `target`, removing the original only
    /// after the compressed copy is in place
    fn compress_into(&self, compression: &Compression, target: &Path) -> Result<()> {
        let data = fs::read(self.base_path).map_err(|e| {
            LoggerError::io_operation(
                "compress log file",
                format!("Failed to read '{}'", self.base_path.display()),
                e,
            )
        })?;
        let compressed = compression.compress(&data).map_err(|e| {
            LoggerError::io_operation("compress log file", "Compressor failed".to_string(), e)
        })?;

        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, &compressed)
            .and_then(|_| replace_file(&temp_path, target))
            .map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                LoggerError::io_operation(
                    "compress log file",
                    format!("Failed to write '{}'", target.display()),
                    e,
                )
            })?;

        fs::remove_file(self.base_path).map_err(|e| {
            LoggerError::io_operation(
                "compress log file",
                format!(
                    "Compressed copy written but '{}' could not be removed",
                    self.base_path.display()
                ),
                e,
            )
        })
    }
}

/// `name.<index><ext>` next to the active file
pub fn backup_path(base_path: &Path, index: u32, extension: &str) -> PathBuf {
    let mut path = base_path.to_path_buf();
    let filename = base_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("app.log");
    path.set_file_name(format!("{}.{}{}", filename, index, extension));
    path
}

/// Rename, replacing an existing destination
///
/// On some platforms rename fails if the destination exists, so fall back to
/// remove-then-rename.
fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) if to.exists() => {
            let _ = fs::remove_file(to);
            fs::rename(from, to)
        }
        Err(e) => Err(e),
    }
}
