//! Collapsing of repeated messages
//!
//! The first entry with a given key is emitted as is. Further entries with
//! the same key are held back and counted until either a different key
//! arrives, the repeat limit is reached or the timeout fires; the most
//! recent held entry is then emitted once with an `N times: ` prefix.
//!
//! [`CoalescingState`] is a plain state machine. Callers serialize access to
//! it and run the emissions it asks for. Each flushed or cancelled run bumps
//! a generation counter so a timer that fires late recognizes itself as
//! stale and does nothing.

use super::error::{LoggerError, Result};
use super::log_entry::LogEntry;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A held entry ready to be written with its repeat count
#[derive(Debug, Clone, PartialEq)]
pub struct Coalesced {
    pub entry: LogEntry,
    pub count: u32,
    /// Whether the entry may be forwarded to a shipping client
    pub ship: bool,
}

/// What the caller must do with an offered entry
#[derive(Debug)]
pub enum Offer {
    /// Write the entry now, without prefix
    Emit(LogEntry),
    /// Entry held as a repeat; arm a timer with this generation if given
    Held { arm: Option<u64> },
    /// Write the flushed run, then the new entry without prefix
    FlushThenEmit {
        flushed: Coalesced,
        entry: LogEntry,
        stale_timer: Option<CoalesceTimer>,
    },
}

#[derive(Debug)]
pub struct CoalescingState {
    max_count: u32,
    last_key: Option<String>,
    held: Option<(LogEntry, bool)>,
    repeat_count: u32,
    generation: u64,
    timer: Option<CoalesceTimer>,
}

impl CoalescingState {
    /// `max_count == 0` disables collapsing
    pub fn new(max_count: u32) -> Self {
        Self {
            max_count,
            last_key: None,
            held: None,
            repeat_count: 0,
            generation: 0,
            timer: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A repeat run is held and waiting for its flush
    pub fn is_pending(&self) -> bool {
        self.held.is_some()
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn offer(&mut self, key: String, entry: LogEntry, ship: bool) -> Offer {
        if self.max_count == 0 {
            return Offer::Emit(entry);
        }

        let same_key = self.last_key.as_deref() == Some(key.as_str());
        if same_key && self.repeat_count < self.max_count {
            self.repeat_count += 1;
            let arm = if self.held.is_none() {
                Some(self.generation)
            } else {
                None
            };
            self.held = Some((entry, ship));
            return Offer::Held { arm };
        }

        let (flushed, stale_timer) = self.take_pending();
        self.last_key = Some(key);
        self.repeat_count = 1;
        match flushed {
            Some(flushed) => Offer::FlushThenEmit {
                flushed,
                entry,
                stale_timer,
            },
            None => Offer::Emit(entry),
        }
    }

    /// Store the timer armed for the current run
    pub fn arm(&mut self, timer: CoalesceTimer) {
        if let Some(stale) = self.timer.replace(timer) {
            stale.cancel();
        }
    }

    /// Remove the held run, if any, together with its timer
    ///
    /// The key stays remembered with a count of one, so the next identical
    /// entry starts a new run. The returned timer still has to be cancelled
    /// (and joined, where the caller holds no lock the timer needs).
    pub fn take_pending(&mut self) -> (Option<Coalesced>, Option<CoalesceTimer>) {
        let timer = self.timer.take();
        let flushed = self.held.take().map(|(entry, ship)| Coalesced {
            entry,
            count: self.repeat_count,
            ship,
        });
        if flushed.is_some() || timer.is_some() {
            self.generation += 1;
        }
        if flushed.is_some() {
            self.repeat_count = 1;
        }
        (flushed, timer)
    }

    /// Timer path: flush only if the run the timer was armed for is still held
    pub fn take_if_current(&mut self, generation: u64) -> Option<Coalesced> {
        if generation != self.generation || self.held.is_none() {
            return None;
        }
        // The timer is the caller's own thread; detach rather than join
        let (flushed, _own_timer) = self.take_pending();
        flushed
    }
}

/// One-shot timer thread that runs a callback unless cancelled first
#[derive(Debug)]
pub struct CoalesceTimer {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

impl CoalesceTimer {
    pub fn spawn<F>(timeout: Duration, on_fire: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("logpipe-coalesce".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                    on_fire();
                }
            })
            .map_err(|e| {
                LoggerError::io_operation("spawn coalescing timer", "thread spawn failed", e)
            })?;
        Ok(Self { cancel, handle })
    }

    /// Stop the timer without waiting for its thread
    pub fn cancel(self) {
        let _ = self.cancel.try_send(());
    }

    /// Stop the timer and wait until its thread has finished
    pub fn cancel_and_join(self) {
        let _ = self.cancel.try_send(());
        let _ = self.handle.join();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LogLevel;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new("root", LogLevel::Error, message)
    }

    fn offer(state: &mut CoalescingState, message: &str) -> Offer {
        state.offer(message.to_string(), entry(message), true)
    }

    #[test]
    fn test_disabled_always_emits() {
        let mut state = CoalescingState::new(0);
        for _ in 0..3 {
            assert!(matches!(offer(&mut state, "same"), Offer::Emit(_)));
        }
        assert!(!state.is_pending());
    }

    #[test]
    fn test_limit_of_three_over_five_repeats() {
        let mut state = CoalescingState::new(3);

        assert!(matches!(offer(&mut state, "msg"), Offer::Emit(_)));
        assert!(matches!(offer(&mut state, "msg"), Offer::Held { arm: Some(0) }));
        assert!(matches!(offer(&mut state, "msg"), Offer::Held { arm: None }));
        assert_eq!(state.repeat_count(), 3);

        match offer(&mut state, "msg") {
            Offer::FlushThenEmit { flushed, entry, .. } => {
                assert_eq!(flushed.count, 3);
                assert_eq!(entry.message, "msg");
            }
            other => panic!("unexpected {:?}", other),
        }

        // Fifth entry opens a new run under the next generation
        assert!(matches!(offer(&mut state, "msg"), Offer::Held { arm: Some(1) }));
        let flushed = state.take_if_current(1).unwrap();
        assert_eq!(flushed.count, 2);
        assert!(!state.is_pending());
    }

    #[test]
    fn test_different_key_flushes_pending_run() {
        let mut state = CoalescingState::new(10);
        offer(&mut state, "a");
        offer(&mut state, "a");

        match offer(&mut state, "b") {
            Offer::FlushThenEmit { flushed, entry, .. } => {
                assert_eq!(flushed.entry.message, "a");
                assert_eq!(flushed.count, 2);
                assert_eq!(entry.message, "b");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(offer(&mut state, "c"), Offer::Emit(_)));
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let mut state = CoalescingState::new(5);
        offer(&mut state, "x");
        offer(&mut state, "x");
        let (flushed, _) = state.take_pending();
        assert!(flushed.is_some());

        offer(&mut state, "x");
        assert!(state.take_if_current(0).is_none());
        assert!(state.is_pending());
    }

    #[test]
    fn test_held_entry_is_latest_and_keeps_ship_flag() {
        let mut state = CoalescingState::new(5);
        state.offer("k".into(), entry("first"), true);
        state.offer("k".into(), entry("second"), false);
        let (flushed, _) = state.take_pending();
        let flushed = flushed.unwrap();
        assert_eq!(flushed.entry.message, "second");
        assert!(!flushed.ship);
    }

    #[test]
    fn test_timer_fires_after_timeout() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = CoalesceTimer::spawn(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        timer.cancel_and_join();
        // Cancelling immediately may race the timeout; either way it ran at most once
        assert!(fired.load(Ordering::SeqCst) <= 1);

        let counter = Arc::clone(&fired);
        let before = fired.load(Ordering::SeqCst);
        let timer = CoalesceTimer::spawn(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(timer.is_finished());
        assert_eq!(fired.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = CoalesceTimer::spawn(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        timer.cancel_and_join();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
