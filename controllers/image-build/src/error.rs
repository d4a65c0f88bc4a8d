//! Controller-specific error types.
//!
//! Every error classifies itself as retryable or fatal; the watcher's error
//! policy requeues the former with backoff and parks the resource on the
//! latter until it changes.

use cluster_client::ClusterError;
use thiserror::Error;

use crate::job::JobError;

/// Errors that can occur in the ImageBuild Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error raised outside the cluster client
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster client call failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// The builder Job could not be constructed from the ImageBuild
    #[error("Builder job construction failed: {0}")]
    JobConstruction(#[from] JobError),

    /// ImageBuild has no name or namespace
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation exceeded the configured deadline
    #[error("Reconciliation of {0} timed out")]
    Timeout(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Health probe server failed
    #[error("Health server error: {0}")]
    Health(#[from] std::io::Error),
}

impl ControllerError {
    /// Returns true when retrying the same reconciliation may succeed.
    ///
    /// Construction failures, Jobs the API server rejects and malformed
    /// resources only clear when the ImageBuild itself changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Cluster(e) => !e.is_invalid(),
            ControllerError::Kube(_)
            | ControllerError::Timeout(_)
            | ControllerError::Watch(_)
            | ControllerError::Health(_) => true,
            ControllerError::JobConstruction(_)
            | ControllerError::InvalidResource(_)
            | ControllerError::InvalidConfig(_) => false,
        }
    }
}
