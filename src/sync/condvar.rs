//! Condition variable over a sequence counter.
//!
//! `wait` snapshots the sequence, releases the mutex, parks until the
//! sequence moves, and reacquires. Notifications bump the sequence before
//! waking, so a waiter that races past the wake still observes the change
//! on its re-check. Spurious wakeups are possible; callers loop on their
//! predicate as with any condition variable.

use crate::clock::TimePoint;
use crate::error::{Error, ErrorKind, Result};
use crate::park::word::{ParkingWord, WordWait};
use crate::sync::mutex::MutexGuard;

/// A condition variable for fiber mutexes.
#[derive(Debug)]
pub struct Condvar {
    seq: ParkingWord,
}

impl Condvar {
    /// Creates a new condition variable.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: ParkingWord::new(0),
        }
    }

    /// Releases the guard, waits for a notification, and reacquires.
    ///
    /// On cancellation the mutex is **not** reacquired; the wait unwinds
    /// completely and returns [`ErrorKind::Canceled`].
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        self.wait_inner(guard, None).map(|(guard, _)| guard)
    }

    /// Like [`Condvar::wait`], but gives up at `deadline`. The boolean is
    /// true when the wait timed out (the mutex is still reacquired).
    pub fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: TimePoint,
    ) -> Result<(MutexGuard<'a, T>, bool)> {
        self.wait_inner(guard, Some(deadline))
    }

    fn wait_inner<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<TimePoint>,
    ) -> Result<(MutexGuard<'a, T>, bool)> {
        let mutex = guard.source();
        let snapshot = self.seq.load();
        drop(guard);

        let outcome = self.seq.wait_while_equals(snapshot, deadline);
        if outcome == WordWait::Canceled {
            return Err(Error::new(ErrorKind::Canceled));
        }
        let guard = mutex.lock()?;
        Ok((guard, outcome == WordWait::TimedOut))
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1);
        self.seq.wake(1);
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1);
        self.seq.wake_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
