//! Countdown event.
//!
//! A monotonically decreasing counter. `wait` parks until the counter
//! reaches zero; `signal` decrements and wakes every waiter on the
//! transition to zero. Once zero, the event stays signaled.

use crate::clock::TimePoint;
use crate::error::{Error, ErrorKind, Result};
use crate::park::word::{ParkingWord, WordWait};

/// An event that fires when its counter reaches zero.
#[derive(Debug)]
pub struct CountdownEvent {
    word: ParkingWord,
}

impl CountdownEvent {
    /// Creates an event that needs `count` signals to fire.
    #[must_use]
    pub const fn new(count: u32) -> Self {
        Self {
            word: ParkingWord::new(count),
        }
    }

    /// Remaining signals before the event fires.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.word.load()
    }

    /// Decrements the counter by `n` (saturating at zero). Returns the new
    /// count; the transition to zero wakes every waiter.
    pub fn signal(&self, n: u32) -> u32 {
        loop {
            let current = self.word.load();
            if current == 0 {
                return 0;
            }
            let next = current.saturating_sub(n);
            if self.word.compare_exchange(current, next).is_ok() {
                if next == 0 {
                    self.word.wake_all();
                }
                return next;
            }
        }
    }

    /// Parks the caller until the counter reaches zero.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None)
    }

    /// Parks the caller until the counter reaches zero or `deadline`.
    pub fn wait_until(&self, deadline: TimePoint) -> Result<()> {
        self.wait_inner(Some(deadline))
    }

    fn wait_inner(&self, deadline: Option<TimePoint>) -> Result<()> {
        loop {
            let current = self.word.load();
            if current == 0 {
                return Ok(());
            }
            match self.word.wait_while_equals(current, deadline) {
                WordWait::Canceled => return Err(Error::new(ErrorKind::Canceled)),
                WordWait::TimedOut => return Err(Error::new(ErrorKind::Timeout)),
                WordWait::Woke | WordWait::Mismatch => {}
            }
        }
    }
}
