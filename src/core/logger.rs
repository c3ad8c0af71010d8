//! Per-domain logger
//!
//! A [`Logger`] is a cheap, cloneable handle. Logging calls build a
//! [`LogEntry`] and either process it inline (synchronous mode) or hand it
//! to the writer thread of the logger's file (background mode). Processing
//! means: coalesce, format, print to console if requested, append to the
//! file sink, record in the backlog and forward to the shipping client.

use super::{
    attributes::{Attributes, EXC_INFO},
    backlog::Backlog,
    coalescing::{CoalesceTimer, CoalescingState, Offer},
    config::LogConfig,
    error::{LoggerError, Result},
    format,
    log_entry::LogEntry,
    log_level::LogLevel,
    metrics::LoggerMetrics,
    registry::RegistryInner,
    shared_file::{Queued, SharedFileState},
    writer,
};
use crate::appenders::console;
use crate::appenders::file::FileSink;
use crate::appenders::network::{ClientConfig, ShippingClient, ShippingMetrics, ShippingServer};
use crate::appenders::rotating_file::RotationPolicy;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Domain used when none is given
pub const ROOT_DOMAIN: &str = "root";

/// Construction parameters of one logger
///
/// # Example
///
/// ```
/// use logpipe::prelude::*;
///
/// let options = LoggerOptions::new("billing")
///     .level(LogLevel::Debug)
///     .path("/var/log/app/billing.log")
///     .rotation(10 * 1024 * 1024, 5)
///     .console(true);
/// assert!(options.rotation_policy().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub(crate) domain: String,
    pub(crate) level: LogLevel,
    pub(crate) path: Option<PathBuf>,
    pub(crate) max_size: u64,
    pub(crate) backup_count: u32,
    pub(crate) console: bool,
    pub(crate) server: Option<String>,
    pub(crate) connect: Option<String>,
    pub(crate) client: ClientConfig,
}

impl LoggerOptions {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            level: LogLevel::default(),
            path: None,
            max_size: 0,
            backup_count: 0,
            console: false,
            server: None,
            connect: None,
            client: ClientConfig::default(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Log file; loggers with the same resolved path share one file
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Size limit in bytes and number of backups kept
    #[must_use]
    pub fn rotation(mut self, max_size: u64, backup_count: u32) -> Self {
        self.max_size = max_size;
        self.backup_count = backup_count;
        self
    }

    #[must_use]
    pub fn console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    /// Accept shipped entries on this address (e.g. "0.0.0.0:5140")
    #[must_use]
    pub fn server(mut self, bind: impl Into<String>) -> Self {
        self.server = Some(bind.into());
        self
    }

    /// Mirror every entry to the aggregator at this address
    #[must_use]
    pub fn connect(mut self, peer: impl Into<String>) -> Self {
        self.connect = Some(peer.into());
        self
    }

    #[must_use]
    pub fn client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn rotation_policy(&self) -> Result<RotationPolicy> {
        RotationPolicy::new(self.max_size, self.backup_count)
    }
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self::new(ROOT_DOMAIN)
    }
}

/// Processing side of a logger, shared with its file's writer thread
pub(crate) struct LoggerCore {
    domain: String,
    console: bool,
    config: Arc<LogConfig>,
    backlog: Arc<Backlog>,
    metrics: LoggerMetrics,
    coalescer: Mutex<CoalescingState>,
    shipping: Option<ShippingClient>,
    file: Option<Arc<SharedFileState>>,
    this: Weak<LoggerCore>,
}

impl LoggerCore {
    pub(crate) fn new(
        domain: String,
        console: bool,
        config: Arc<LogConfig>,
        backlog: Arc<Backlog>,
        file: Option<Arc<SharedFileState>>,
        shipping: Option<ShippingClient>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            domain,
            console,
            coalescer: Mutex::new(CoalescingState::new(config.same_msg_count_max())),
            config,
            backlog,
            metrics: LoggerMetrics::new(),
            shipping,
            file,
            this: this.clone(),
        })
    }

    pub(crate) fn file(&self) -> Option<&Arc<SharedFileState>> {
        self.file.as_ref()
    }

    fn report(&self, message: &str) {
        self.backlog.report(message, self.config.colors());
    }

    /// Route an entry to the inline path or the writer queue
    fn submit(self: &Arc<Self>, entry: LogEntry, ship: bool) -> Result<()> {
        match self.file {
            Some(ref file) if file.background() => {
                let queued = Queued::Entry {
                    origin: Arc::clone(self),
                    entry,
                    ship,
                };
                if file.enqueue(queued) {
                    Ok(())
                } else {
                    Err(LoggerError::LoggerStopped)
                }
            }
            Some(ref file) => {
                let mut sink = file.sink.lock();
                self.isolated(|| self.process(Some(&mut *sink), entry, ship));
                Ok(())
            }
            None => {
                self.isolated(|| self.process(None, entry, ship));
                Ok(())
            }
        }
    }

    fn isolated(&self, f: impl FnOnce()) {
        if let Err(message) = writer::isolate(f) {
            self.report(&format!("logger '{}' recovered from panic: {}", self.domain, message));
        }
    }

    /// Coalesce and emit one entry; caller holds the sink lock if any
    pub(crate) fn process(&self, mut sink: Option<&mut FileSink>, entry: LogEntry, ship: bool) {
        if !self.config.coalescing_enabled() {
            self.emit(sink, &entry, 0, ship);
            return;
        }

        let mut coalescer = self.coalescer.lock();
        let key = self.config.message_key(&entry);
        match coalescer.offer(key, entry, ship) {
            Offer::Emit(entry) => self.emit(sink, &entry, 0, ship),
            Offer::Held { arm } => {
                self.metrics.record_coalesced();
                if let Some(generation) = arm {
                    match self.spawn_timer(generation) {
                        Ok(timer) => coalescer.arm(timer),
                        Err(e) => self.report(&e.to_string()),
                    }
                }
            }
            Offer::FlushThenEmit {
                flushed,
                entry,
                stale_timer,
            } => {
                if let Some(timer) = stale_timer {
                    timer.cancel();
                }
                self.emit(sink.as_deref_mut(), &flushed.entry, flushed.count, flushed.ship);
                self.emit(sink, &entry, 0, ship);
            }
        }
    }

    fn spawn_timer(&self, generation: u64) -> Result<CoalesceTimer> {
        let core = self.this.clone();
        CoalesceTimer::spawn(self.config.same_msg_timeout(), move || {
            if let Some(core) = core.upgrade() {
                core.on_timer(generation);
            }
        })
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        match self.file {
            Some(ref file) if file.background() => {
                file.enqueue(Queued::FlushCoalesced {
                    origin: Arc::clone(self),
                    generation,
                });
            }
            Some(ref file) => {
                let mut sink = file.sink.lock();
                self.isolated(|| self.flush_coalesced(Some(&mut *sink), generation));
            }
            None => self.isolated(|| self.flush_coalesced(None, generation)),
        }
    }

    /// Timer flush; a no-op if the run was already flushed
    pub(crate) fn flush_coalesced(&self, sink: Option<&mut FileSink>, generation: u64) {
        let mut coalescer = self.coalescer.lock();
        if let Some(flushed) = coalescer.take_if_current(generation) {
            self.emit(sink, &flushed.entry, flushed.count, flushed.ship);
        }
    }

    /// Force out a held run; the returned timer must be cancelled by the
    /// caller once it holds no lock the timer could need
    pub(crate) fn drain_coalescer(&self, sink: Option<&mut FileSink>) -> Option<CoalesceTimer> {
        let mut coalescer = self.coalescer.lock();
        let (flushed, timer) = coalescer.take_pending();
        if let Some(flushed) = flushed {
            self.emit(sink, &flushed.entry, flushed.count, flushed.ship);
        }
        timer
    }

    fn emit(&self, sink: Option<&mut FileSink>, entry: &LogEntry, count: u32, ship: bool) {
        let line = format::with_repeat_count(format::render(&self.config, entry), count);

        if self.console || entry.attrs.console() {
            console::print(entry, &line, self.config.colors());
        }

        if let Some(sink) = sink {
            let outcome = sink.append(&line, self.config.use_background_writer());
            for _ in 0..outcome.rotations {
                self.metrics.record_rotation();
            }
            for error in outcome.errors {
                self.metrics.record_write_failure();
                self.report(&error.to_string());
            }
        }

        self.metrics.record_emitted();
        self.backlog.push_entry(entry);

        if ship {
            if let Some(ref client) = self.shipping {
                client.log(entry.clone());
            }
        }
    }

    /// Begin stopping; returns the acknowledgement of a queued detach
    fn stop(self: &Arc<Self>, immediate: bool) -> Option<Receiver<()>> {
        match self.file {
            Some(ref file) if file.background() => {
                if immediate {
                    file.discard_from(self);
                }
                let (done, ack) = bounded(1);
                let queued = Queued::Detach {
                    origin: Arc::clone(self),
                    done,
                };
                file.enqueue(queued).then_some(ack)
            }
            Some(ref file) => {
                let timer = {
                    let mut sink = file.sink.lock();
                    let mut timer = None;
                    self.isolated(|| timer = self.drain_coalescer(Some(&mut *sink)));
                    if let Err(e) = sink.flush() {
                        self.metrics.record_write_failure();
                        self.report(&e.to_string());
                    }
                    file.detach_locked(&mut sink);
                    timer
                };
                if let Some(timer) = timer {
                    timer.cancel_and_join();
                }
                None
            }
            None => {
                let mut timer = None;
                self.isolated(|| timer = self.drain_coalescer(None));
                if let Some(timer) = timer {
                    timer.cancel_and_join();
                }
                None
            }
        }
    }

    fn rotate(&self) {
        let Some(ref file) = self.file else {
            return;
        };
        if !file.policy().is_enabled() {
            return;
        }
        if file.background() {
            file.request_rotate();
            self.metrics.record_rotation();
            return;
        }

        let mut sink = file.sink.lock();
        match sink.rotate() {
            Ok(report) => {
                self.metrics.record_rotation();
                for skipped in report.skipped {
                    self.report(&skipped.to_string());
                }
            }
            Err(e) => {
                self.metrics.record_write_failure();
                self.report(&e.to_string());
            }
        }
    }

    fn flush(&self) -> Result<()> {
        match self.file {
            None => Ok(()),
            Some(ref file) if file.background() => {
                let (done, ack) = bounded(1);
                if file.enqueue(Queued::Flush { done }) {
                    let _ = ack.recv();
                }
                Ok(())
            }
            Some(ref file) => file.sink.lock().flush().inspect_err(|e| {
                self.metrics.record_write_failure();
                self.report(&e.to_string());
            }),
        }
    }

    fn stop_shipping(&self) {
        if let Some(ref client) = self.shipping {
            client.stop();
        }
    }
}

struct LoggerInner {
    core: Arc<LoggerCore>,
    level: AtomicU8,
    stopped: AtomicBool,
    pending_detach: Mutex<Option<Receiver<()>>>,
    server: Option<ShippingServer>,
    registry: Weak<RegistryInner>,
}

impl LoggerInner {
    fn stop(&self, immediate: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ref server) = self.server {
            server.stop();
        }
        let ack = self.core.stop(immediate);
        *self.pending_detach.lock() = ack;
    }

    fn join(&self) {
        if !self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let ack = self.pending_detach.lock().take();
        if let Some(ack) = ack {
            // A disconnect means the writer is gone; nothing left to wait for
            let _ = ack.recv();
        }
        if let Some(file) = self.core.file() {
            file.join_writer();
        }
        self.core.stop_shipping();
    }
}

impl Drop for LoggerInner {
    fn drop(&mut self) {
        self.stop(false);
        self.join();
    }
}

/// Handle to a per-domain logger
///
/// Clones refer to the same logger. Obtain one from
/// [`LogRegistry::get_logger`](crate::LogRegistry::get_logger) or the global
/// [`get_logger`](crate::get_logger).
///
/// # Example
///
/// ```
/// use logpipe::prelude::*;
///
/// let registry = LogRegistry::new(LogConfig::default());
/// let logger = registry.get_logger(LoggerOptions::new("app")).unwrap();
///
/// logger.info("service started").unwrap();
/// logger.debug("not written at the default INFO level").unwrap();
/// logger.shutdown(false).unwrap();
/// assert!(logger.info("too late").is_err());
/// ```
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub(crate) fn new(
        core: Arc<LoggerCore>,
        level: LogLevel,
        server: Option<ShippingServer>,
        registry: Weak<RegistryInner>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                core,
                level: AtomicU8::new(level.as_u8()),
                stopped: AtomicBool::new(false),
                pending_detach: Mutex::new(None),
                server,
                registry,
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.inner.core.domain
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level.as_u8(), Ordering::Relaxed);
    }

    /// Whether the level-gated operations would process `level`
    #[inline]
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level >= self.level()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Log regardless of the level threshold
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.log_with_attrs(level, message, Attributes::new())
    }

    pub fn log_with_attrs(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        attrs: Attributes,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(LoggerError::LoggerStopped);
        }
        let entry = LogEntry::new(self.domain(), level, message).with_attrs(attrs);
        self.inner.core.submit(entry, true)
    }

    fn gated(&self, level: LogLevel, message: impl Into<String>, attrs: Attributes) -> Result<()> {
        if !self.is_enabled(level) {
            return Ok(());
        }
        self.log_with_attrs(level, message, attrs)
    }

    pub fn debug(&self, message: impl Into<String>) -> Result<()> {
        self.gated(LogLevel::Debug, message, Attributes::new())
    }

    pub fn info(&self, message: impl Into<String>) -> Result<()> {
        self.gated(LogLevel::Info, message, Attributes::new())
    }

    pub fn warning(&self, message: impl Into<String>) -> Result<()> {
        self.gated(LogLevel::Warning, message, Attributes::new())
    }

    pub fn error(&self, message: impl Into<String>) -> Result<()> {
        self.gated(LogLevel::Error, message, Attributes::new())
    }

    pub fn fatal(&self, message: impl Into<String>) -> Result<()> {
        self.gated(LogLevel::Fatal, message, Attributes::new())
    }

    /// Same as [`Logger::fatal`]
    pub fn critical(&self, message: impl Into<String>) -> Result<()> {
        self.fatal(message)
    }

    /// Log at EXCEPTION level with the current stack trace attached
    pub fn exception(&self, message: impl Into<String>) -> Result<()> {
        self.exception_with(message, Attributes::new())
    }

    pub fn exception_with(&self, message: impl Into<String>, attrs: Attributes) -> Result<()> {
        if !self.is_enabled(LogLevel::Exception) {
            return Ok(());
        }
        let mut attrs = attrs;
        attrs.insert(EXC_INFO, Backtrace::force_capture().to_string());
        self.log_with_attrs(LogLevel::Exception, message, attrs)
    }

    pub fn debug_with(&self, message: impl Into<String>, attrs: Attributes) -> Result<()> {
        self.gated(LogLevel::Debug, message, attrs)
    }

    pub fn info_with(&self, message: impl Into<String>, attrs: Attributes) -> Result<()> {
        self.gated(LogLevel::Info, message, attrs)
    }

    pub fn warning_with(&self, message: impl Into<String>, attrs: Attributes) -> Result<()> {
        self.gated(LogLevel::Warning, message, attrs)
    }

    pub fn error_with(&self, message: impl Into<String>, attrs: Attributes) -> Result<()> {
        self.gated(LogLevel::Error, message, attrs)
    }

    pub fn fatal_with(&self, message: impl Into<String>, attrs: Attributes) -> Result<()> {
        self.gated(LogLevel::Fatal, message, attrs)
    }

    /// Stop accepting entries
    ///
    /// A graceful stop lets queued entries drain; an immediate stop discards
    /// this logger's queued entries. A held repeat run is always written.
    /// Calling it again has no effect.
    pub fn stop(&self, immediate: bool) -> Result<()> {
        self.inner.stop(immediate);
        Ok(())
    }

    /// Wait until a stop has completed; returns at once if not stopped
    pub fn join(&self) {
        self.inner.join();
    }

    /// Stop, wait, and remove the domain from its registry
    pub fn shutdown(&self, immediate: bool) -> Result<()> {
        self.stop(immediate)?;
        self.join();
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.unregister(self);
        }
        Ok(())
    }

    /// Rotate the log file now (no-op without size-based rotation)
    pub fn rotate(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(LoggerError::LoggerStopped);
        }
        self.inner.core.rotate();
        Ok(())
    }

    /// Write out buffered bytes, waiting for the writer in background mode
    pub fn flush(&self) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        self.inner.core.flush()
    }

    pub fn metrics(&self) -> &LoggerMetrics {
        &self.inner.core.metrics
    }

    pub fn shipping_metrics(&self) -> Option<&ShippingMetrics> {
        self.inner.core.shipping.as_ref().map(ShippingClient::metrics)
    }

    /// Resolved path of the log file
    pub fn file_path(&self) -> Option<&Path> {
        self.inner.core.file().map(|file| file.path())
    }

    /// Open handles of this logger's file across the registry
    pub fn open_file_handles(&self) -> usize {
        self.inner.core.file().map_or(0, |file| file.open_handles())
    }

    /// Both loggers write through the same file state
    pub fn shares_file_with(&self, other: &Logger) -> bool {
        match (self.inner.core.file(), other.inner.core.file()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Address of the shipping server started for this logger
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.inner.server.as_ref().and_then(ShippingServer::local_addr)
    }

    pub(crate) fn ptr_eq(&self, other: &Logger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn core(&self) -> &Arc<LoggerCore> {
        &self.inner.core
    }

    pub(crate) fn start_server(&self) -> Result<()> {
        if let Some(ref server) = self.inner.server {
            server.start()?;
        }
        Ok(())
    }

    pub(crate) fn stop_server(&self) {
        if let Some(ref server) = self.inner.server {
            server.stop();
        }
    }

    /// Feed an entry received from a shipping client; never re-shipped
    pub(crate) fn ingest(&self, entry: LogEntry) {
        if self.is_stopped() || !self.is_enabled(entry.level) {
            return;
        }
        if let Err(e) = self.inner.core.submit(entry, false) {
            self.inner.core.report(&e.to_string());
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("domain", &self.domain())
            .field("level", &self.level())
            .field("path", &self.file_path())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::LogRegistry;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_options_validation() {
        assert!(LoggerOptions::new("a").rotation(100, 0).rotation_policy().is_err());
        assert!(LoggerOptions::new("a").rotation(0, 2).rotation_policy().is_err());
        assert!(LoggerOptions::default().rotation_policy().is_ok());
        assert_eq!(LoggerOptions::default().domain(), "root");
    }

    #[test]
    fn test_level_gate_and_set_level() {
        let registry = LogRegistry::new(LogConfig::default());
        let logger = registry.get_logger(LoggerOptions::new("gate")).unwrap();
        assert!(!logger.is_enabled(LogLevel::Debug));

        logger.debug("hidden").unwrap();
        assert_eq!(logger.metrics().emitted(), 0);

        logger.set_level(LogLevel::Debug);
        logger.debug("shown").unwrap();
        assert_eq!(logger.metrics().emitted(), 1);

        // log() ignores the threshold
        logger.set_level(LogLevel::NoLog);
        logger.log(LogLevel::Debug, "forced").unwrap();
        assert_eq!(logger.metrics().emitted(), 2);
    }

    #[test]
    fn test_stop_rejects_and_is_idempotent() {
        let registry = LogRegistry::new(LogConfig::default());
        let logger = registry.get_logger(LoggerOptions::new("once")).unwrap();
        logger.stop(false).unwrap();
        logger.stop(true).unwrap();
        logger.join();
        logger.shutdown(false).unwrap();
        assert!(matches!(logger.info("late"), Err(LoggerError::LoggerStopped)));
    }

    #[test]
    fn test_exception_attaches_trace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exc.log");
        let registry = LogRegistry::new(LogConfig::default());
        let logger = registry
            .get_logger(LoggerOptions::new("exc").path(&path))
            .unwrap();
        logger.exception("boom").unwrap();
        logger.shutdown(false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().ends_with("EXCEPTION: boom"));
        assert!(lines.next().is_some());
    }

    #[test]
    fn test_stop_flushes_held_repeats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("held.log");
        let config = LogConfig::builder()
            .same_msg_count_max(10)
            .same_msg_timeout(Duration::from_secs(60))
            .time_format("")
            .build()
            .unwrap();
        let registry = LogRegistry::new(config);
        let logger = registry
            .get_logger(LoggerOptions::new("held").path(&path))
            .unwrap();
        for _ in 0..4 {
            logger.error("retrying").unwrap();
        }
        logger.shutdown(false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec![" ERROR: retrying", "4 times:  ERROR: retrying"]);
        assert_eq!(logger.metrics().coalesced(), 3);
    }
}
