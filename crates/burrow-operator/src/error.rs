//! Error types for the Burrow Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation before it could be confirmed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A resource quantity could not be parsed
    #[error("Invalid quantity '{value}': {reason}")]
    InvalidQuantity { value: String, reason: String },

    /// Requested storage is smaller than what a claim already holds
    #[error("shrinking persistent volumes is not supported: claim {claim} has {current}, requested {desired}")]
    StorageShrink {
        claim: String,
        current: String,
        desired: String,
    },

    /// A replica without storage cannot be given storage after the fact
    #[error("changing from ephemeral to persistent storage is not supported: claim {claim} requested {desired}")]
    EphemeralToPersistent { claim: String, desired: String },

    /// Lowering the replica count would drop brokers and strand their claims
    #[error("Cluster scale down not supported; tried to scale cluster from {current} nodes to {desired} nodes")]
    ScaleDown { current: i32, desired: i32 },
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Timeout(_)
                | OperatorError::Cancelled(_)
                | OperatorError::ReconcileFailed(_)
        )
    }

    /// Whether retrying can never fix this error without a spec change
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            OperatorError::StorageShrink { .. }
                | OperatorError::EphemeralToPersistent { .. }
                | OperatorError::ScaleDown { .. }
                | OperatorError::InvalidQuantity { .. }
                | OperatorError::InvalidConfig(_)
                | OperatorError::ValidationError(_)
        )
    }

    /// Condition reason reported when this error ends a reconcile pass
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::StorageShrink { .. }
            | OperatorError::EphemeralToPersistent { .. }
            | OperatorError::Cancelled(_) => "FailedReconcilePersistence",
            OperatorError::InvalidQuantity { .. }
            | OperatorError::InvalidConfig(_)
            | OperatorError::ValidationError(_) => "InvalidSpec",
            OperatorError::ScaleDown { .. } => "UnsupportedOperation",
            OperatorError::Timeout(_) => "Timeout",
            _ => "Error",
        }
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }
}
