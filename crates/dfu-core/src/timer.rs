//! Virtual-time timer queue.
//!
//! Delayed events live here until the session's clock passes their
//! deadline. Time only moves when [`TimerQueue::advance`] is called, so
//! scenarios run instantly and deterministically.

use tracing::trace;

/// Handle for cancelling one scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone)]
struct Entry<T> {
    id: TimerId,
    deadline: u64,
    item: T,
}

#[derive(Debug, Clone)]
pub struct TimerQueue<T> {
    now: u64,
    next_id: u64,
    entries: Vec<Entry<T>>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            now: 0,
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds since the queue was created.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn schedule(&mut self, delay_ms: u32, item: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = self.now + u64::from(delay_ms);
        trace!(deadline, delay_ms, "Timer armed");
        self.entries.push(Entry { id, deadline, item });
        id
    }

    /// Remove one entry; returns its item if it had not fired.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index).item)
    }

    /// Remove every pending entry matching `pred`.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(&e.item));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Deadline of the earliest pending entry.
    pub fn next_due(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Move the clock forward and return what fell due, earliest first.
    /// Entries with equal deadlines come out in scheduling order.
    pub fn advance(&mut self, ms: u64) -> Vec<T> {
        self.now = self.now.saturating_add(ms);
        self.pop_due()
    }

    /// Take everything due at the current time without moving the clock.
    pub fn pop_due(&mut self) -> Vec<T> {
        let now = self.now;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|e| e.deadline <= now);
        self.entries = pending;
        due.sort_by_key(|e| (e.deadline, e.id.0));
        due.into_iter().map(|e| e.item).collect()
    }
}
