//! Logger metrics for observability
//!
//! Counters for monitoring pipeline health: emitted lines, collapsed
//! repeats, write failures and rotations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for one logger
///
/// # Example
///
/// ```
/// use logpipe::LoggerMetrics;
///
/// let metrics = LoggerMetrics::new();
/// metrics.record_emitted();
/// metrics.record_coalesced();
///
/// assert_eq!(metrics.emitted(), 1);
/// assert_eq!(metrics.coalesced(), 1);
/// ```
#[derive(Debug)]
pub struct LoggerMetrics {
    /// Lines produced by the pipeline (after coalescing)
    emitted: AtomicU64,

    /// Entries held back as repeats of the previous message
    coalesced: AtomicU64,

    /// Failed flushes, rotations or hook invocations
    write_failures: AtomicU64,

    /// Completed file rotations
    rotations: AtomicU64,
}

impl LoggerMetrics {
    /// Create a new metrics instance with all counters at zero
    pub const fn new() -> Self {
        Self {
            emitted: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_emitted(&self) -> u64 {
        self.emitted.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_coalesced(&self) -> u64 {
        self.coalesced.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_write_failure(&self) -> u64 {
        self.write_failures.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_rotation(&self) -> u64 {
        self.rotations.fetch_add(1, Ordering::Relaxed)
    }

    /// Share of entries that were collapsed into repeat lines (0.0 - 100.0)
    pub fn coalesce_rate(&self) -> f64 {
        let coalesced = self.coalesced() as f64;
        let total = self.emitted() as f64 + coalesced;
        if total == 0.0 {
            0.0
        } else {
            (coalesced / total) * 100.0
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.emitted.store(0, Ordering::Relaxed);
        self.coalesced.store(0, Ordering::Relaxed);
        self.write_failures.store(0, Ordering::Relaxed);
        self.rotations.store(0, Ordering::Relaxed);
    }
}

impl Default for LoggerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for LoggerMetrics {
    /// Create a snapshot of the current metrics values
    fn clone(&self) -> Self {
        Self {
            emitted: AtomicU64::new(self.emitted()),
            coalesced: AtomicU64::new(self.coalesced()),
            write_failures: AtomicU64::new(self.write_failures()),
            rotations: AtomicU64::new(self.rotations()),
        }
    }
}
