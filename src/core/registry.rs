//! Domain registry and process-wide entry points
//!
//! A [`LogRegistry`] maps domain names to loggers, owns the configuration
//! and the diagnostic backlog, and makes loggers with the same resolved
//! path share one [`SharedFileState`]. The free functions at the bottom
//! operate on one global registry created by [`log_init`].

use super::{
    backlog::{Backlog, BacklogItem},
    config::LogConfig,
    error::{LoggerError, Result},
    log_entry::LogEntry,
    log_level::LogLevel,
    logger::{Logger, LoggerCore, LoggerOptions},
    shared_file::SharedFileState,
};
use crate::appenders::network::{RemoteSink, ShippingClient, ShippingServer};
use crate::appenders::rotating_file::RotationPolicy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

pub(crate) struct RegistryInner {
    config: Arc<LogConfig>,
    backlog: Arc<Backlog>,
    loggers: Mutex<HashMap<String, Logger>>,
    files: Mutex<HashMap<PathBuf, Weak<SharedFileState>>>,
    handle_counts: Mutex<HashMap<PathBuf, Arc<AtomicUsize>>>,
}

impl RegistryInner {
    fn build_logger(self: &Arc<Self>, options: LoggerOptions) -> Result<Logger> {
        let policy = options.rotation_policy()?;
        let path = options.path.as_deref().map(resolve_path).transpose()?;

        let shipping = match options.connect {
            Some(ref peer) => {
                let client = ShippingClient::new(peer.clone(), options.client.clone());
                client.start()?;
                Some(client)
            }
            None => None,
        };

        let server = options.server.as_ref().map(|bind| {
            let injector = DomainInjector {
                registry: Arc::downgrade(self),
                path: path.clone(),
                policy,
            };
            ShippingServer::new(bind.clone(), Arc::new(injector))
        });

        let file = match path {
            Some(ref path) => Some(self.attach_file(path, policy)?),
            None => None,
        };

        let core = LoggerCore::new(
            options.domain.clone(),
            options.console,
            Arc::clone(&self.config),
            Arc::clone(&self.backlog),
            file,
            shipping,
        );
        let logger = Logger::new(core, options.level, server, Arc::downgrade(self));

        if options.server.is_some() {
            if let Err(e) = logger.start_server() {
                // Releases the file attachment again
                let _ = logger.stop(true);
                logger.join();
                return Err(e);
            }
        }
        Ok(logger)
    }

    /// Reuse the open state of `path` or open the file
    fn attach_file(&self, path: &Path, policy: RotationPolicy) -> Result<Arc<SharedFileState>> {
        let mut files = self.files.lock();
        if let Some(state) = files.get(path).and_then(Weak::upgrade) {
            if state.try_attach() {
                return Ok(state);
            }
            // Closed by its last logger; make sure the handle is gone first
            state.wait_released();
        }

        let counter = Arc::clone(
            self.handle_counts
                .lock()
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
        );
        let state = SharedFileState::open(
            path.to_path_buf(),
            policy,
            Arc::clone(&self.config),
            Arc::clone(&self.backlog),
            counter,
        )?;
        files.retain(|_, weak| weak.strong_count() > 0);
        files.insert(path.to_path_buf(), Arc::downgrade(&state));
        Ok(state)
    }

    fn register(&self, logger: Logger) {
        let previous = self
            .loggers
            .lock()
            .insert(logger.domain().to_string(), logger);
        if let Some(previous) = previous {
            previous.stop_server();
            let _ = previous.stop(false);
            previous.join();
        }
    }

    pub(crate) fn unregister(&self, logger: &Logger) {
        let mut loggers = self.loggers.lock();
        if loggers
            .get(logger.domain())
            .is_some_and(|current| current.ptr_eq(logger))
        {
            loggers.remove(logger.domain());
        }
    }

    fn get_or_create(self: &Arc<Self>, options: LoggerOptions) -> Result<Logger> {
        if let Some(existing) = self.loggers.lock().get(options.domain()) {
            return Ok(existing.clone());
        }
        let logger = self.build_logger(options)?;
        let mut loggers = self.loggers.lock();
        match loggers.get(logger.domain()) {
            // Lost a race against another creator: keep theirs
            Some(existing) => {
                let existing = existing.clone();
                drop(loggers);
                let _ = logger.shutdown(true);
                Ok(existing)
            }
            None => {
                loggers.insert(logger.domain().to_string(), logger.clone());
                Ok(logger)
            }
        }
    }

    fn shutdown_all(&self, immediate: bool) {
        loop {
            let drained: Vec<Logger> = self.loggers.lock().drain().map(|(_, l)| l).collect();
            if drained.is_empty() {
                break;
            }
            // Servers first so no new domains appear while draining
            for logger in &drained {
                logger.stop_server();
            }
            for logger in &drained {
                let _ = logger.stop(immediate);
            }
            for logger in &drained {
                logger.join();
            }
        }
    }
}

/// Absolute path with a canonical parent directory, created if missing
fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| LoggerError::io_operation("resolve log path", "no current directory", e))?
            .join(path)
    };
    let file_name = absolute
        .file_name()
        .ok_or_else(|| {
            LoggerError::config("LoggerOptions", format!("'{}' is not a file path", path.display()))
        })?
        .to_owned();
    let parent = absolute.parent().unwrap_or_else(|| Path::new("/"));
    fs::create_dir_all(parent).map_err(|e| {
        LoggerError::io_operation(
            "create log directory",
            format!("Failed to create directory '{}'", parent.display()),
            e,
        )
    })?;
    let parent = parent.canonicalize().map_err(|e| {
        LoggerError::io_operation(
            "resolve log path",
            format!("Cannot canonicalize '{}'", parent.display()),
            e,
        )
    })?;
    Ok(parent.join(file_name))
}

/// Feeds entries received by a shipping server into the registry
struct DomainInjector {
    registry: Weak<RegistryInner>,
    path: Option<PathBuf>,
    policy: RotationPolicy,
}

impl RemoteSink for DomainInjector {
    fn deliver(&self, entry: LogEntry) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut options = LoggerOptions::new(entry.domain.clone()).level(LogLevel::NotSet);
        if let Some(ref path) = self.path {
            options = options
                .path(path)
                .rotation(self.policy.max_size(), self.policy.backup_count());
        }
        match registry.get_or_create(options) {
            Ok(logger) => logger.ingest(entry),
            Err(e) => registry
                .backlog
                .report(&format!("cannot create domain '{}': {}", entry.domain, e), registry.config.colors()),
        }
    }
}

/// Registry of per-domain loggers sharing one configuration
///
/// Dropping the registry shuts all its loggers down gracefully.
///
/// # Example
///
/// ```
/// use logpipe::prelude::*;
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("app.log");
///
/// let registry = LogRegistry::new(LogConfig::default());
/// let api = registry.get_logger(LoggerOptions::new("api").path(&path)).unwrap();
/// let db = registry.get_logger(LoggerOptions::new("db").path(&path)).unwrap();
/// assert!(api.shares_file_with(&db));
///
/// api.info("request served").unwrap();
/// db.warning("slow query").unwrap();
/// registry.shutdown_all(false);
///
/// let content = std::fs::read_to_string(&path).unwrap();
/// assert_eq!(content.lines().count(), 2);
/// ```
pub struct LogRegistry {
    inner: Arc<RegistryInner>,
}

impl LogRegistry {
    pub fn new(config: LogConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config: Arc::new(config),
                backlog: Arc::new(Backlog::new()),
                loggers: Mutex::new(HashMap::new()),
                files: Mutex::new(HashMap::new()),
                handle_counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    /// Create the logger for a domain, replacing (and stopping) any logger
    /// previously registered under that domain
    pub fn get_logger(&self, options: LoggerOptions) -> Result<Logger> {
        // Unlocked before joining: connection threads of the old server may
        // be waiting on the domain map
        let previous = self.inner.loggers.lock().remove(options.domain());
        if let Some(previous) = previous {
            previous.stop_server();
            let _ = previous.stop(false);
            previous.join();
        }
        let logger = self.inner.build_logger(options)?;
        self.inner.register(logger.clone());
        Ok(logger)
    }

    /// Registered logger of a domain
    pub fn logger(&self, domain: &str) -> Option<Logger> {
        self.inner.loggers.lock().get(domain).cloned()
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.inner.loggers.lock().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Stop every logger (draining unless `immediate`) and empty the registry
    pub fn shutdown_all(&self, immediate: bool) {
        self.inner.shutdown_all(immediate);
    }

    /// Rotate every distinct log file once, however many domains share it
    pub fn rotate_all(&self) {
        let loggers: Vec<Logger> = self.inner.loggers.lock().values().cloned().collect();
        let mut seen: Vec<Arc<SharedFileState>> = Vec::new();
        for logger in loggers {
            let Some(file) = logger.core().file() else {
                continue;
            };
            if seen.iter().any(|s| Arc::ptr_eq(s, file)) {
                continue;
            }
            seen.push(Arc::clone(file));
            let _ = logger.rotate();
        }
    }

    /// Resize the diagnostic backlog; 0 disables it
    pub fn set_backlog_size(&self, size: usize) {
        self.inner.backlog.set_capacity(size);
    }

    pub fn backlog(&self) -> Vec<BacklogItem> {
        self.inner.backlog.snapshot()
    }

    /// Handle-count probe for a log path
    pub fn open_handles(&self, path: impl AsRef<Path>) -> usize {
        let Ok(resolved) = resolve_path(path.as_ref()) else {
            return 0;
        };
        self.inner
            .handle_counts
            .lock()
            .get(&resolved)
            .map_or(0, |count| count.load(std::sync::atomic::Ordering::SeqCst))
    }
}

impl Drop for LogRegistry {
    fn drop(&mut self) {
        self.inner.shutdown_all(false);
    }
}

impl std::fmt::Debug for LogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRegistry")
            .field("config", &self.inner.config)
            .field("domains", &self.domains())
            .finish()
    }
}

static GLOBAL: RwLock<Option<LogRegistry>> = parking_lot::const_rwlock(None);

/// Create (or replace) a logger in the global registry
///
/// The first call fixes the configuration for the process; later calls only
/// use `options`.
pub fn log_init(config: LogConfig, options: LoggerOptions) -> Result<Logger> {
    {
        let mut global = GLOBAL.write();
        if global.is_none() {
            *global = Some(LogRegistry::new(config));
        }
    }
    get_logger(options)
}

/// Create (or replace) a logger in the global registry after [`log_init`]
pub fn get_logger(options: LoggerOptions) -> Result<Logger> {
    let global = GLOBAL.read();
    match *global {
        Some(ref registry) => registry.get_logger(options),
        None => Err(LoggerError::NotInitialized),
    }
}

/// Registered logger of a domain in the global registry
pub fn logger(domain: &str) -> Option<Logger> {
    GLOBAL.read().as_ref().and_then(|registry| registry.logger(domain))
}

/// Stop every logger of the global registry; call before the process exits
pub fn shutdown_all(immediate: bool) {
    if let Some(ref registry) = *GLOBAL.read() {
        registry.shutdown_all(immediate);
    }
}

pub fn rotate_all() {
    if let Some(ref registry) = *GLOBAL.read() {
        registry.rotate_all();
    }
}

pub fn set_backlog_size(size: usize) {
    if let Some(ref registry) = *GLOBAL.read() {
        registry.set_backlog_size(size);
    }
}

pub fn backlog() -> Vec<BacklogItem> {
    GLOBAL
        .read()
        .as_ref()
        .map(LogRegistry::backlog)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_path_creates_parent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("app.log");
        let resolved = resolve_path(&nested).unwrap();
        assert!(resolved.parent().unwrap().is_dir());
        assert_eq!(resolved.file_name().unwrap(), "app.log");
    }

    #[test]
    fn test_same_path_shares_one_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.log");
        let registry = LogRegistry::new(LogConfig::default());

        let a = registry.get_logger(LoggerOptions::new("a").path(&path)).unwrap();
        let b = registry
            .get_logger(LoggerOptions::new("b").path(dir.path().join(".").join("shared.log")))
            .unwrap();
        assert!(a.shares_file_with(&b));
        assert_eq!(registry.open_handles(&path), 1);

        a.shutdown(false).unwrap();
        assert_eq!(registry.open_handles(&path), 1);
        b.shutdown(false).unwrap();
        assert_eq!(registry.open_handles(&path), 0);
    }

    #[test]
    fn test_get_logger_replaces_domain() {
        let registry = LogRegistry::new(LogConfig::default());
        let first = registry.get_logger(LoggerOptions::new("svc")).unwrap();
        let second = registry.get_logger(LoggerOptions::new("svc")).unwrap();
        assert!(first.is_stopped());
        assert!(!second.is_stopped());
        assert!(registry.logger("svc").unwrap().ptr_eq(&second));
    }

    #[test]
    fn test_shutdown_removes_domain() {
        let registry = LogRegistry::new(LogConfig::default());
        let logger = registry.get_logger(LoggerOptions::new("gone")).unwrap();
        registry.get_logger(LoggerOptions::new("kept")).unwrap();
        logger.shutdown(false).unwrap();
        assert_eq!(registry.domains(), vec!["kept".to_string()]);
    }

    #[test]
    fn test_invalid_rotation_is_rejected() {
        let registry = LogRegistry::new(LogConfig::default());
        let result = registry.get_logger(LoggerOptions::new("bad").rotation(0, 3));
        assert!(matches!(result, Err(LoggerError::InvalidConfiguration { .. })));
        assert!(registry.domains().is_empty());
    }
}
