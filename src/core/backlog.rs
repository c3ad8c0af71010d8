//! Bounded diagnostic history of recent entries and failures
//!
//! The backlog is not storage: it only keeps the last few items so a crashed
//! or misbehaving pipeline can be inspected after the fact.

use super::log_entry::LogEntry;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum BacklogItem {
    Entry(LogEntry),
    Error(String),
}

#[derive(Debug, Default)]
pub struct Backlog {
    inner: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    capacity: usize,
    items: VecDeque<BacklogItem>,
}

impl Ring {
    fn push(&mut self, item: BacklogItem) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }
}

impl Backlog {
    /// Disabled backlog (capacity 0)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let backlog = Self::new();
        backlog.set_capacity(capacity);
        backlog
    }

    /// Resize, keeping the most recent items; 0 disables and clears
    pub fn set_capacity(&self, capacity: usize) {
        let mut ring = self.inner.lock();
        ring.capacity = capacity;
        if capacity == 0 {
            ring.items.clear();
            return;
        }
        while ring.items.len() > capacity {
            ring.items.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity() > 0
    }

    pub fn push_entry(&self, entry: &LogEntry) {
        let mut ring = self.inner.lock();
        if ring.capacity > 0 {
            ring.push(BacklogItem::Entry(entry.clone()));
        }
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.inner.lock().push(BacklogItem::Error(message.into()));
    }

    /// Record a steady-state failure and print it to stderr
    pub(crate) fn report(&self, message: &str, colors: bool) {
        crate::appenders::console::print_error(message, colors);
        self.push_error(message);
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<BacklogItem> {
        self.inner.lock().items.iter().cloned().collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner
            .lock()
            .items
            .iter()
            .filter_map(|item| match item {
                BacklogItem::Error(message) => Some(message.clone()),
                BacklogItem::Entry(_) => None,
            })
            .collect()
    }
}
