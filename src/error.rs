//! Error types for the storage-backend operator
//!
//! Provides structured error types for the backend reconciler, the
//! provisioning-service client, and the controller wiring. The taxonomy
//! distinguishes configuration errors (fatal, not retried), precondition
//! errors (resource spec incomplete, left for the user to correct),
//! external-service errors (retried by the controller on the next event),
//! and consistency errors (a resource claims an identifier the provisioning
//! service does not recognize).

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    #[error("Precondition failed for {resource}: {reason}")]
    Precondition { resource: String, reason: String },

    // =========================================================================
    // Provisioning Service Errors
    // =========================================================================
    #[error("Provisioning service connection error: {0}")]
    ProvisionerConnection(#[from] reqwest::Error),

    #[error("Provisioning service rejected {operation} (status {status}): {message}")]
    ProvisionerApi {
        operation: String,
        status: u16,
        message: String,
    },

    /// A resource claims a provisioning-service identifier the service does
    /// not recognize. Automated repair is unsafe, so the operation fails and
    /// stays failed until an operator intervenes.
    #[error("Consistency error for {resource}: provisioning service does not recognize id {id}")]
    Consistency { resource: String, id: String },

    // =========================================================================
    // Bootstrap Errors
    // =========================================================================
    #[error("Deployment {namespace}/{name} not ready after {waited:?}")]
    BootstrapTimeout {
        namespace: String,
        name: String,
        waited: Duration,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::ProvisionerConnection(_) | Error::ProvisionerApi { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // The provisioning daemon may still be rolling out - long retry
            Error::BootstrapTimeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(300)),

            // Spec incomplete or stale identifier - wait for user correction
            Error::Configuration(_) | Error::Precondition { .. } | Error::Consistency { .. } => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::ProvisionerConnection(_) | Error::ProvisionerApi { .. }
        )
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;
        match err {
            FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
            other => Error::Internal(other.to_string()),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::BootstrapTimeout {
            namespace: "default".into(),
            name: "heketi".into(),
            waited: Duration::from_secs(300),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(300))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Precondition {
            resource: "default/node-0".into(),
            reason: "no storage network".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::ProvisionerApi {
            operation: "create cluster".into(),
            status: 503,
            message: "unavailable".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let stale = Error::Consistency {
            resource: "default/node-0".into(),
            id: "abc123".into(),
        };
        assert!(!stale.is_retryable());
        assert!(!stale.is_transient());
    }
}
