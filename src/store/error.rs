//! Domain-specific error types for store operations.
//!
//! Typed errors let reconcilers tell a lost race from a missing object from
//! a transient failure without parsing messages.

use std::time::Duration;

use crate::resources::Kind;

/// Errors returned by the object store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum StoreError {
    /// The object does not exist (or no longer exists).
    #[error("{kind} '{name}' not found")]
    NotFound { kind: Kind, name: String },

    /// An object with the same name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: Kind, name: String },

    /// The write was based on a stale resource version.
    #[error("conflict writing {kind} '{name}': expected version {expected}, found {actual}")]
    Conflict {
        kind: Kind,
        name: String,
        expected: u64,
        actual: u64,
    },

    /// The call did not complete within the configured timeout.
    #[error("store call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The store could not serve the request.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// The object itself is malformed; retrying the same write cannot help.
    #[error("invalid {kind}: {message}")]
    Invalid { kind: Kind, message: String },
}

impl StoreError {
    /// Creates a `NotFound` error.
    pub fn not_found(kind: Kind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Creates an `AlreadyExists` error.
    pub fn already_exists(kind: Kind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Creates a `Conflict` error.
    pub fn conflict(kind: Kind, name: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
            expected,
            actual,
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates an `Invalid` error.
    pub fn invalid(kind: Kind, message: impl Into<String>) -> Self {
        Self::Invalid {
            kind,
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Timeout { .. } | Self::Unavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = StoreError::not_found(Kind::Claim, "c1");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "SandboxClaim 'c1' not found");
    }

    #[test]
    fn test_conflict_error() {
        let err = StoreError::conflict(Kind::Sandbox, "sb", 3, 5);
        assert!(err.is_conflict());
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "conflict writing Sandbox 'sb': expected version 3, found 5"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = StoreError::timeout(Duration::from_millis(1500));
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "store call timed out after 1500 ms");
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let exists = StoreError::already_exists(Kind::WarmPool, "p");
        let down = StoreError::unavailable("leader lost");

        assert!(!exists.is_transient());
        assert!(!exists.is_not_found());
        assert!(!exists.is_conflict());

        assert!(down.is_transient());
        assert!(!down.is_conflict());
    }

    #[test]
    fn test_invalid_error_is_not_transient() {
        let err = StoreError::invalid(Kind::Sandbox, "empty name");
        assert!(!err.is_transient());
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "invalid Sandbox: empty name");
    }
}
