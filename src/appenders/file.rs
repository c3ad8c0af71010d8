//! Buffered log file sink
//!
//! A `FileSink` owns the single open handle of one physical log file, the
//! in-memory line buffer and the write position used for rotation. It is
//! always accessed under the lock of its `SharedFileState`, so buffering,
//! flushing and rotation never interleave.

use super::rotating_file::{RotationManager, RotationPolicy, RotationReport};
use crate::core::config::LogConfig;
use crate::core::error::{LoggerError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a writer hook gets to work with on each flush
pub struct FlushContext<'a> {
    pub path: &'a Path,
    pub data: &'a [u8],
    pub file: &'a mut File,
}

/// Result of appending one line
#[derive(Debug, Default)]
pub struct AppendOutcome {
    pub rotations: u32,
    pub errors: Vec<LoggerError>,
}

pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    buffer: Vec<u8>,
    written_size: u64,
    policy: RotationPolicy,
    config: Arc<LogConfig>,
    /// Last flush failed and the buffer was kept for one more attempt
    retry_pending: bool,
    open_handles: Arc<AtomicUsize>,
}

impl FileSink {
    /// Open (or create) the file for appending
    ///
    /// The write position starts at the current file length.
    pub fn open(path: impl Into<PathBuf>, policy: RotationPolicy, config: Arc<LogConfig>) -> Result<Self> {
        Self::open_counted(path, policy, config, Arc::new(AtomicUsize::new(0)))
    }

    /// Like [`FileSink::open`], tracking open handles in a shared counter
    pub fn open_counted(
        path: impl Into<PathBuf>,
        policy: RotationPolicy,
        config: Arc<LogConfig>,
        open_handles: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LoggerError::io_operation(
                    "create log directory",
                    format!("Failed to create directory '{}'", parent.display()),
                    e,
                )
            })?;
        }

        let file = open_file(&path, &open_handles)?;
        let written_size = file
            .metadata()
            .map_err(|e| {
                LoggerError::io_operation(
                    "open log file",
                    format!("Cannot access metadata of '{}'", path.display()),
                    e,
                )
            })?
            .len();

        Ok(Self {
            path,
            file: Some(file),
            buffer: Vec::new(),
            written_size,
            policy,
            config,
            retry_pending: false,
            open_handles,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Bytes buffered but not yet written
    pub fn buffered_size(&self) -> usize {
        self.buffer.len()
    }

    /// Position in the current file, including buffered bytes
    pub fn written_size(&self) -> u64 {
        self.written_size
    }

    /// Buffer one formatted line, flushing and rotating as the policy requires
    ///
    /// `background` selects threshold-based flushing; otherwise every line is
    /// written through immediately.
    pub fn append(&mut self, line: &str, background: bool) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        let mut bytes = self.config.encoding().encode(line);
        bytes.push(b'\n');
        let size = bytes.len() as u64;

        if self.policy.would_overflow(self.written_size, size) {
            self.rotate_into(&mut outcome);
        }

        self.buffer.extend_from_slice(&bytes);
        self.written_size += size;

        if !background || self.buffer.len() >= self.config.flush_threshold() {
            if let Err(e) = self.flush() {
                outcome.errors.push(e);
            }
        }

        if self.policy.is_due(self.written_size) {
            self.rotate_into(&mut outcome);
        }

        outcome
    }

    fn rotate_into(&mut self, outcome: &mut AppendOutcome) {
        match self.rotate() {
            Ok(report) => {
                outcome.rotations += 1;
                outcome.errors.extend(report.skipped);
            }
            Err(e) => outcome.errors.push(e),
        }
    }

    /// Write buffered bytes to the file
    ///
    /// On failure the buffer is kept for one retry; a second consecutive
    /// failure discards it.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.file.is_none() {
            self.file = Some(open_file(&self.path, &self.open_handles)?);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(LoggerError::writer("log file not open"));
        };

        let result = match self.config.writer {
            Some(ref writer) => writer(&mut FlushContext {
                path: &self.path,
                data: &self.buffer,
                file,
            }),
            None => file.write_all(&self.buffer),
        };

        match result {
            Ok(()) => {
                self.buffer.clear();
                self.retry_pending = false;
                Ok(())
            }
            Err(e) if self.retry_pending => {
                let dropped = self.buffer.len();
                self.buffer.clear();
                self.retry_pending = false;
                Err(LoggerError::io_operation(
                    "flushing log file",
                    format!(
                        "'{}': dropped {} buffered bytes after repeated failure",
                        self.path.display(),
                        dropped
                    ),
                    e,
                ))
            }
            Err(e) => {
                self.retry_pending = true;
                Err(LoggerError::io_operation(
                    "flushing log file",
                    format!("'{}': buffer kept for retry", self.path.display()),
                    e,
                ))
            }
        }
    }

    /// Flush, close, shift backups and reopen a fresh file
    pub fn rotate(&mut self) -> Result<RotationReport> {
        self.flush().map_err(|e| {
            LoggerError::file_rotation(
                self.path.display().to_string(),
                format!("Failed to flush before rotation: {}", e),
            )
        })?;
        self.close_handle();

        let result = RotationManager::new(
            &self.path,
            self.policy.backup_count(),
            self.config.compression(),
        )
        .rotate();

        // Reopen even after a failed rotation so logging can continue. The
        // position restarts at zero to avoid rotating on every line.
        match open_file(&self.path, &self.open_handles) {
            Ok(file) => self.file = Some(file),
            Err(reopen_err) => {
                return Err(LoggerError::file_rotation(
                    self.path.display().to_string(),
                    format!("Failed to reopen log file after rotation: {}", reopen_err),
                ));
            }
        }
        self.written_size = 0;
        result
    }

    /// Flush and release the file handle; safe to call repeatedly
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        self.close_handle();
        flushed
    }

    fn close_handle(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.sync_data();
            drop(file);
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // Best effort flush - ignore errors during drop
        let _ = self.close();
    }
}

fn open_file(path: &Path, open_handles: &AtomicUsize) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            LoggerError::io_operation(
                "open log file",
                format!("Failed to open '{}'", path.display()),
                e,
            )
        })?;

    #[cfg(feature = "file")]
    {
        use fs2::FileExt;
        if let Err(e) = file.try_lock_exclusive() {
            eprintln!(
                "[LOGGER WARNING] '{}' is locked by another process ({}); writes may interleave",
                path.display(),
                e
            );
        }
    }

    open_handles.fetch_add(1, Ordering::SeqCst);
    Ok(file)
}
