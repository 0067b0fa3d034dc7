//! Error types and error handling strategy for the fiber runtime.
//!
//! All runtime errors are returned as values; nothing unwinds across the
//! trampoline boundary of a fiber. The taxonomy is deliberately small:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - A stale version-tagged identifier is always [`ErrorKind::InvalidId`]
//! - Waiting primitives are fully unwound on timeout or cancellation
//!   (no half-acquired state is ever observable)

use core::fmt;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The identifier's version no longer matches; the referenced entity has
    /// been recycled.
    InvalidId,
    /// A deadline expired before the operation completed.
    Timeout,
    /// A stop was requested while the operation was in progress.
    Canceled,
    /// A pool or queue limit was hit; the caller may back off and retry.
    ResourceExhausted,
    /// The operation would deadlock the calling fiber (self-join, relocking
    /// a non-recursive mutex).
    WouldDeadlock,
    /// The execution queue has been stopped and accepts no more tasks.
    QueueStopped,
    /// The runtime is shutting down.
    Shutdown,
    /// Invariant violation inside the runtime. Always a bug.
    Internal,
}

impl ErrorKind {
    /// Returns a static description of the error kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidId => "identifier version mismatch",
            Self::Timeout => "deadline expired",
            Self::Canceled => "operation canceled",
            Self::ResourceExhausted => "resource exhausted",
            Self::WouldDeadlock => "operation would deadlock",
            Self::QueueStopped => "execution queue stopped",
            Self::Shutdown => "runtime shutting down",
            Self::Internal => "internal runtime error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for fiber runtime operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Creates a new error with the given kind and context message.
    #[must_use]
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: Some(context.into()),
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self.kind, ErrorKind::Canceled)
    }

    /// Returns true if this error represents an expired deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error represents a stale identifier.
    #[must_use]
    pub const fn is_invalid_id(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidId)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}: {context}", self.kind),
            None => self.kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Result alias used throughout the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::with_context(ErrorKind::Timeout, "mutex lock");
        assert_eq!(err.to_string(), "deadline expired: mutex lock");
        assert!(err.is_timeout());
    }

    #[test]
    fn kind_predicates() {
        assert!(Error::new(ErrorKind::Canceled).is_canceled());
        assert!(Error::new(ErrorKind::InvalidId).is_invalid_id());
        assert!(!Error::new(ErrorKind::Internal).is_timeout());
    }
}
