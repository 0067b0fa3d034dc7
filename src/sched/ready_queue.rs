//! Per-worker ready queue.
//!
//! The owner pushes and pops at the back (LIFO, for cache locality of
//! just-woken fibers); stealers take from the front (FIFO, for a measure of
//! fairness across stealers). A lock-based deque keeps the work-stealing
//! semantics easy to verify; the lock is uncontended except when a thief
//! probes this worker.

use crate::id::FiberId;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A bounded double-ended ready queue.
#[derive(Debug)]
pub(crate) struct ReadyQueue {
    capacity: usize,
    inner: Mutex<VecDeque<FiberId>>,
}

impl ReadyQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Appends at the owner's end. On a full queue the id is handed back so
    /// the caller can spill it into the group overflow deque.
    pub(crate) fn push(&self, id: FiberId) -> Result<(), FiberId> {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            return Err(id);
        }
        queue.push_back(id);
        Ok(())
    }

    /// Requeues a yielding fiber at the steal end, so everything already
    /// queued runs before the yielder comes around again.
    pub(crate) fn push_front(&self, id: FiberId) {
        self.inner.lock().push_front(id);
    }

    /// Owner pop, LIFO.
    pub(crate) fn pop(&self) -> Option<FiberId> {
        self.inner.lock().pop_back()
    }

    /// Thief pop, FIFO. Entries for which `is_pinned` returns true are never
    /// stolen; a pinned fiber at the steal end makes the probe give up
    /// rather than reorder the queue.
    pub(crate) fn steal(&self, is_pinned: impl Fn(FiberId) -> bool) -> Option<FiberId> {
        let mut queue = self.inner.lock();
        let candidate = *queue.front()?;
        if is_pinned(candidate) {
            return None;
        }
        queue.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
