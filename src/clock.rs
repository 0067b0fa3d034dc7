//! Monotonic time for deadlines and the timer wheel.
//!
//! All deadlines inside the runtime are absolute [`TimePoint`]s measured in
//! nanoseconds from the process-wide monotonic epoch (the first observation
//! of the clock). Using a plain `u64` keeps deadline comparison and wheel
//! slot arithmetic branch-free.

use core::fmt;
use std::ops::Add;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A monotonic instant, in nanoseconds since the runtime's epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimePoint(u64);

impl TimePoint {
    /// The epoch itself.
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a time point from raw nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns the instant as nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Adds a duration, saturating on overflow.
    #[must_use]
    pub const fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_nanos() as u64))
    }

    /// Returns the duration from `earlier` to `self`, or zero if `self` is
    /// not after `earlier`.
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for TimePoint {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.saturating_add(rhs)
    }
}

impl fmt::Debug for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimePoint({}ns)", self.0)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000 {
            write!(
                f,
                "{}.{:03}s",
                self.0 / 1_000_000_000,
                (self.0 / 1_000_000) % 1000
            )
        } else if self.0 >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else {
            write!(f, "{}us", self.0 / 1_000)
        }
    }
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Reads the current monotonic time.
#[must_use]
pub fn now() -> TimePoint {
    TimePoint(epoch().elapsed().as_nanos() as u64)
}

/// Converts a relative duration into an absolute deadline from now.
#[must_use]
pub fn deadline_after(d: Duration) -> TimePoint {
    now().saturating_add(d)
}
