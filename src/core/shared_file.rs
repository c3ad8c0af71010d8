//! State shared by all loggers writing to one physical file
//!
//! Every logger whose resolved path matches an open file attaches to the
//! same `SharedFileState`: one sink, one queue and, in background mode, one
//! writer thread. The file is closed when the last attached logger detaches.
//!
//! Lock order: `sink` before `queue`, and `sink` before any logger's
//! coalescing state.

use super::backlog::Backlog;
use super::config::LogConfig;
use super::error::{LoggerError, Result};
use super::log_entry::LogEntry;
use super::logger::LoggerCore;
use super::writer;
use crate::appenders::file::FileSink;
use crate::appenders::rotating_file::RotationPolicy;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work items for the writer thread
pub(crate) enum Queued {
    Entry {
        origin: Arc<LoggerCore>,
        entry: LogEntry,
        ship: bool,
    },
    /// Posted by a coalescing timer; ignored if the run was already flushed
    FlushCoalesced {
        origin: Arc<LoggerCore>,
        generation: u64,
    },
    /// Write out buffered bytes and acknowledge
    Flush { done: Sender<()> },
    /// A logger stops; closes the file once no logger is attached
    Detach {
        origin: Arc<LoggerCore>,
        done: Sender<()>,
    },
}

impl Queued {
    fn origin(&self) -> Option<&Arc<LoggerCore>> {
        match self {
            Queued::Entry { origin, .. }
            | Queued::FlushCoalesced { origin, .. }
            | Queued::Detach { origin, .. } => Some(origin),
            Queued::Flush { .. } => None,
        }
    }
}

pub(crate) struct FileQueue {
    pub(crate) items: VecDeque<Queued>,
    attached: usize,
    closed: bool,
}

pub(crate) struct SharedFileState {
    path: PathBuf,
    policy: RotationPolicy,
    config: Arc<LogConfig>,
    backlog: Arc<Backlog>,
    pub(crate) sink: Mutex<FileSink>,
    pub(crate) queue: Mutex<FileQueue>,
    pub(crate) wake: Condvar,
    pub(crate) rotate_requested: AtomicBool,
    open_handles: Arc<AtomicUsize>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SharedFileState {
    /// Open the file with one attached logger, starting the writer thread in
    /// background mode
    pub(crate) fn open(
        path: PathBuf,
        policy: RotationPolicy,
        config: Arc<LogConfig>,
        backlog: Arc<Backlog>,
        open_handles: Arc<AtomicUsize>,
    ) -> Result<Arc<Self>> {
        let sink = FileSink::open_counted(&path, policy, Arc::clone(&config), Arc::clone(&open_handles))?;
        let state = Arc::new(Self {
            path,
            policy,
            config,
            backlog,
            sink: Mutex::new(sink),
            queue: Mutex::new(FileQueue {
                items: VecDeque::new(),
                attached: 1,
                closed: false,
            }),
            wake: Condvar::new(),
            rotate_requested: AtomicBool::new(false),
            open_handles,
            writer: Mutex::new(None),
        });

        if state.config.use_background_writer() {
            let worker = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name("logpipe-writer".to_string())
                .spawn(move || writer::run(worker))
                .map_err(|e| {
                    LoggerError::io_operation(
                        "spawn writer thread",
                        state.path.display().to_string(),
                        e,
                    )
                })?;
            *state.writer.lock() = Some(handle);
        }
        Ok(state)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Record a failure that has no originating logger
    pub(crate) fn report(&self, message: &str) {
        self.backlog.report(message, self.config.colors());
    }

    pub(crate) fn background(&self) -> bool {
        self.config.use_background_writer()
    }

    /// Handle-count probe: open handles of this path in the process
    pub(crate) fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Join another logger to this file; fails once the file was closed
    pub(crate) fn try_attach(&self) -> bool {
        let mut queue = self.queue.lock();
        if queue.closed {
            return false;
        }
        queue.attached += 1;
        true
    }

    /// Block until a concurrent close of the sink has completed
    pub(crate) fn wait_released(&self) {
        drop(self.sink.lock());
    }

    /// Hand an item to the writer; false once the file was closed
    pub(crate) fn enqueue(&self, item: Queued) -> bool {
        let mut queue = self.queue.lock();
        if queue.closed {
            return false;
        }
        queue.items.push_back(item);
        self.wake.notify_one();
        true
    }

    /// Ask the writer to rotate before its next item
    pub(crate) fn request_rotate(&self) {
        let _queue = self.queue.lock();
        self.rotate_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Drop queued work of one logger, leaving siblings untouched
    pub(crate) fn discard_from(&self, origin: &Arc<LoggerCore>) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.items.len();
        queue.items.retain(|item| match item {
            Queued::Detach { .. } => true,
            other => !other.origin().is_some_and(|o| Arc::ptr_eq(o, origin)),
        });
        before - queue.items.len()
    }

    /// Release one attachment with the sink already locked
    ///
    /// Closes the file when it was the last one. Returns true if so.
    pub(crate) fn detach_locked(&self, sink: &mut MutexGuard<'_, FileSink>) -> bool {
        let (last, _stale) = {
            let mut queue = self.queue.lock();
            queue.attached = queue.attached.saturating_sub(1);
            if queue.attached == 0 {
                queue.closed = true;
                (true, std::mem::take(&mut queue.items))
            } else {
                (false, VecDeque::new())
            }
        };
        if last {
            if let Err(e) = sink.close() {
                self.report(&e.to_string());
            }
        }
        last
    }

    /// Wait for the writer thread once the file is closed
    pub(crate) fn join_writer(&self) {
        if !self.is_closed() {
            return;
        }
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                self.report(&format!("writer thread for '{}' panicked", self.path.display()));
            }
        }
    }
}
