use crate::resources::{InvalidTransition, Kind};
use crate::runtime::ProvisionError;
use crate::store::StoreError;

/// Why a reconcile pass stopped early.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// The object references something missing or malformed. Recorded on
    /// the object's status; retried only when the spec changes.
    #[error("invalid {kind} '{name}': {message}")]
    Validation {
        kind: Kind,
        name: String,
        message: String,
    },

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl ReconcileError {
    pub fn validation(kind: Kind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            kind,
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns true if the object vanished while being reconciled.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }

    /// Returns true if the key should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Provision(e) => e.is_retryable(),
            Self::Validation { .. } | Self::Transition(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_classification() {
        assert!(ReconcileError::from(StoreError::timeout(Duration::from_secs(1))).is_transient());
        assert!(ReconcileError::from(StoreError::conflict(Kind::Sandbox, "sb", 1, 2)).is_transient());
        assert!(!ReconcileError::from(StoreError::not_found(Kind::Sandbox, "sb")).is_transient());
        assert!(ReconcileError::from(ProvisionError::failed("boom")).is_transient());
        assert!(!ReconcileError::from(ProvisionError::rejected("bad")).is_transient());
        assert!(!ReconcileError::validation(Kind::Claim, "c", "no target").is_transient());
    }

    #[test]
    fn test_validation_message() {
        let err = ReconcileError::validation(Kind::WarmPool, "python", "template 'py' not found");
        assert_eq!(
            err.to_string(),
            "invalid SandboxWarmPool 'python': template 'py' not found"
        );
    }
}
