//! Fiber mutex.
//!
//! A three-state word: unlocked, locked-uncontended, locked-contended. The
//! fast path is a single compare-exchange; the slow path publishes
//! contention and parks on the word, and unlock wakes one waiter only when
//! contention was published. Non-recursive: relocking on the same fiber (or
//! thread) reports [`ErrorKind::WouldDeadlock`] instead of hanging.

use crate::clock::TimePoint;
use crate::error::{Error, ErrorKind, Result};
use crate::park::word::{ParkingWord, WordWait};
use crate::sched::worker;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A key identifying the lock holder, for deadlock detection: the fiber id
/// when on a fiber, a per-thread token otherwise.
fn holder_key() -> u64 {
    if let Some(id) = worker::current_fiber() {
        return id.as_u64();
    }
    thread_local! {
        static THREAD_KEY: Cell<u64> = const { Cell::new(0) };
    }
    static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);
    THREAD_KEY.with(|key| {
        if key.get() == 0 {
            key.set(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed) | 1 << 63);
        }
        key.get()
    })
}

/// A mutual-exclusion lock usable from fibers and plain threads alike.
#[derive(Debug)]
pub struct Mutex<T> {
    word: ParkingWord,
    holder: AtomicU64,
    data: RwLock<T>,
}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex around `value`.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            word: ParkingWord::new(UNLOCKED),
            holder: AtomicU64::new(0),
            data: RwLock::new(value),
        }
    }

    /// Acquires the lock, suspending the calling fiber while it is held
    /// elsewhere.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.lock_inner(None)
    }

    /// Acquires the lock, giving up at `deadline` with
    /// [`ErrorKind::Timeout`].
    pub fn lock_until(&self, deadline: TimePoint) -> Result<MutexGuard<'_, T>> {
        self.lock_inner(Some(deadline))
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.word.compare_exchange(UNLOCKED, LOCKED).is_ok() {
            Some(self.guard())
        } else {
            None
        }
    }

    fn lock_inner(&self, deadline: Option<TimePoint>) -> Result<MutexGuard<'_, T>> {
        let key = holder_key();
        if self.holder.load(Ordering::SeqCst) == key {
            return Err(Error::new(ErrorKind::WouldDeadlock));
        }
        if self.word.compare_exchange(UNLOCKED, LOCKED).is_ok() {
            return Ok(self.guard());
        }
        loop {
            // Publish contention; if the word was free, that published swap
            // is also our acquisition.
            if self.word.swap(CONTENDED) == UNLOCKED {
                return Ok(self.guard());
            }
            match self.word.wait_while_equals(CONTENDED, deadline) {
                WordWait::Canceled => return Err(Error::new(ErrorKind::Canceled)),
                WordWait::TimedOut => return Err(Error::new(ErrorKind::Timeout)),
                WordWait::Woke | WordWait::Mismatch => {}
            }
        }
    }

    fn guard(&self) -> MutexGuard<'_, T> {
        self.holder.store(holder_key(), Ordering::SeqCst);
        MutexGuard {
            mutex: self,
            data: Some(self.data.write()),
        }
    }

    fn release(&self) {
        self.holder.store(0, Ordering::SeqCst);
        if self.word.swap(UNLOCKED) == CONTENDED {
            self.word.wake(1);
        }
    }

    /// Whether the lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load() != UNLOCKED
    }

    /// Consumes the mutex and returns its value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard; the lock is released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    data: Option<RwLockWriteGuard<'a, T>>,
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn source(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data.as_ref().expect("guard accessed after release")
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data.as_mut().expect("guard accessed after release")
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the data guard before waking the next holder.
        self.data.take();
        self.mutex.release();
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}
