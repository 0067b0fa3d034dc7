//! The parking array: where idle workers wait for work.
//!
//! Each worker owns a [`ParkSite`], a single futex word it sleeps on. An
//! idle worker publishes itself in the group's [`IdleArray`] tagged with its
//! snapshot of the group's work epoch, rescans once, and only then sleeps.
//! Producers wake the most recently parked worker (warmest caches) after
//! publishing new work; a worker that raced past the wake observes the
//! epoch bump on its final rescan instead.

use crate::park::futex;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A worker's private park word. Wakes are modeled as generation bumps so a
/// wake that lands between "decide to sleep" and "actually sleep" turns the
/// sleep into an immediate return.
#[derive(Debug)]
pub(crate) struct ParkSite {
    pub(crate) word: AtomicU32,
}

impl ParkSite {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            word: AtomicU32::new(0),
        })
    }

    /// Current generation; pass to [`futex::wait`] as the expected value.
    pub(crate) fn generation(&self) -> u32 {
        self.word.load(Ordering::SeqCst)
    }

    /// Bumps the generation and wakes the worker if it is sleeping.
    pub(crate) fn wake(&self) {
        self.word.fetch_add(1, Ordering::SeqCst);
        futex::wake(&self.word, 1);
    }
}

#[derive(Debug)]
struct IdleEntry {
    worker: u32,
    site: Arc<ParkSite>,
    #[allow(dead_code)]
    tag: u64,
}

/// Fixed-capacity table of parked workers.
#[derive(Debug)]
pub(crate) struct IdleArray {
    capacity: usize,
    entries: Mutex<Vec<IdleEntry>>,
}

impl IdleArray {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Publishes a worker as parked, tagged with its epoch snapshot.
    /// Returns false when the array is full; the caller should spin briefly
    /// instead of sleeping.
    pub(crate) fn publish(&self, worker: u32, site: Arc<ParkSite>, tag: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return false;
        }
        entries.push(IdleEntry { worker, site, tag });
        true
    }

    /// Removes a worker's entry, if present.
    pub(crate) fn retract(&self, worker: u32) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.worker != worker);
    }

    /// Wakes the most recently parked worker. Returns false when the array
    /// was empty.
    pub(crate) fn wake_one(&self) -> bool {
        let entry = self.entries.lock().pop();
        match entry {
            Some(entry) => {
                entry.site.wake();
                true
            }
            None => false,
        }
    }

    /// Wakes every parked worker. Used for shutdown.
    pub(crate) fn wake_all(&self) {
        let drained: Vec<IdleEntry> = std::mem::take(&mut *self.entries.lock());
        for entry in drained {
            entry.site.wake();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
