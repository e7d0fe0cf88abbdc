//! Bounded record of recently completed sessions (most recent first)

use crate::session::CompletedSession;
use std::collections::VecDeque;

/// Fixed-capacity ring buffer; the oldest entry is evicted on overflow.
#[derive(Debug)]
pub struct RecentSessions {
    entries: VecDeque<CompletedSession>,
    capacity: usize,
}

impl RecentSessions {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend `entry`, dropping the oldest once over capacity.
    pub fn push(&mut self, entry: CompletedSession) {
        self.entries.push_front(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// Entries in most-recent-first order
    pub fn list_all(&self) -> Vec<CompletedSession> {
        self.entries.iter().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
