//! Version-tagged identifier types for runtime entities.
//!
//! Every pooled entity in the runtime (fibers, timers, sessions, execution
//! queues) is addressed by a slot index plus a version counter. The version
//! is bumped when a slot is recycled, so a holder of a stale identifier is
//! rejected instead of touching the slot's new occupant.
//!
//! Fiber versions step in twos: an even version is a live fiber, the
//! following odd version marks the slot as terminated-but-not-reused. This
//! lets `join` distinguish "completed" (version advanced by one) from
//! "recycled" (version advanced further), which must report
//! [`InvalidId`](crate::ErrorKind::InvalidId).

use core::fmt;

/// A unique identifier for a fiber.
///
/// Packs a 32-bit slot index and a 32-bit version. The version is even for
/// the fiber's whole lifetime and becomes odd when the fiber terminates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    slot: u32,
    version: u32,
}

impl FiberId {
    pub(crate) const fn new(slot: u32, version: u32) -> Self {
        Self { slot, version }
    }

    /// Returns the slot index.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Returns the version counter.
    #[must_use]
    pub const fn version(self) -> u32 {
        self.version
    }

    /// Packs the identifier into a single 64-bit value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.version as u64) << 32) | self.slot as u64
    }

    /// Rebuilds an identifier from its packed 64-bit form.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            slot: raw as u32,
            version: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({}:{})", self.slot, self.version)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.slot)
    }
}

/// Opaque handle for a scheduled timer.
///
/// Carries a monotonic token so a late `cancel` on a recycled wheel entry is
/// rejected instead of canceling an unrelated timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) token: u64,
}

impl TimerId {
    /// Returns the monotonic token.
    #[must_use]
    pub const fn token(self) -> u64 {
        self.token
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({})", self.token)
    }
}

/// A version-tagged session identifier, `(version << 32) | slot`.
///
/// Sessions protect a per-slot mutex and an error callback from
/// use-after-free: once the session is destroyed its version is bumped, and
/// every operation on the old id returns `InvalidId` without side effect.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub(crate) slot: u32,
    pub(crate) version: u32,
}

impl SessionId {
    /// An id value that never names a live session.
    pub const INVALID: Self = Self {
        slot: u32::MAX,
        version: 0,
    };

    pub(crate) const fn new(slot: u32, version: u32) -> Self {
        Self { slot, version }
    }

    /// Packs the identifier into a single 64-bit value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.version as u64) << 32) | self.slot as u64
    }

    /// Rebuilds an identifier from its packed 64-bit form.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            slot: raw as u32,
            version: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}:{})", self.slot, self.version)
    }
}

/// Identifier for an execution queue, used for logging and diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) u64);

impl QueueId {
    /// Returns the raw queue number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_id_round_trips_through_u64() {
        let id = FiberId::new(17, 42);
        assert_eq!(FiberId::from_u64(id.as_u64()), id);
        assert_eq!(id.slot(), 17);
        assert_eq!(id.version(), 42);
    }

    #[test]
    fn session_id_round_trips_through_u64() {
        let id = SessionId::new(3, 9);
        assert_eq!(SessionId::from_u64(id.as_u64()), id);
        assert_ne!(id, SessionId::INVALID);
    }
}
