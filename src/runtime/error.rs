//! Domain-specific error types for pod runtime operations.
//!
//! Typed errors enable the lifecycle manager to tell a spec the runtime will
//! never accept from a failure worth retrying.

use std::time::Duration;

/// Errors that can occur while provisioning or removing a pod.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ProvisionError {
    /// Runtime daemon is not running or not accessible.
    #[error("Runtime is not available: {message}")]
    RuntimeUnavailable { message: String },

    /// Container image was not found.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The runtime refused the pod spec.
    #[error("Pod spec rejected: {message}")]
    Rejected { message: String },

    /// Runtime call exceeded the configured timeout.
    #[error("Runtime call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Pod operation failed (create, start, inspect, remove).
    #[error("Pod operation failed: {message}")]
    Failed { message: String },
}

impl ProvisionError {
    /// Creates a `RuntimeUnavailable` error.
    pub fn runtime_unavailable(message: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `Rejected` error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a `Failed` error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Returns true if a later attempt with the same spec may succeed.
    ///
    /// A missing image or a rejected spec will fail the same way until the
    /// template changes.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ImageNotFound { .. } | Self::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_unavailable_error() {
        let err = ProvisionError::runtime_unavailable("daemon not running");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Runtime is not available: daemon not running"
        );
    }

    #[test]
    fn test_image_not_found_error() {
        let err = ProvisionError::image_not_found("python:missing");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Container image not found: python:missing");
    }

    #[test]
    fn test_rejected_error() {
        let err = ProvisionError::rejected("invalid port");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Pod spec rejected: invalid port");
    }

    #[test]
    fn test_timeout_error() {
        let err = ProvisionError::timeout(Duration::from_secs(10));
        assert!(matches!(err, ProvisionError::Timeout { timeout_ms: 10_000 }));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Runtime call timed out after 10000 ms");
    }

    #[test]
    fn test_failed_error() {
        let err = ProvisionError::failed("failed to start");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Pod operation failed: failed to start");
    }
}
