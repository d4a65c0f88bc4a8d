//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes API error not covered by a more specific variant
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict (stale resourceVersion)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Create rejected because the object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Request rejected as malformed (400) or invalid (422); resending it cannot succeed
    #[error("Rejected: {0}")]
    Invalid(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API call failed for another reason (used by the mock client)
    #[error("Cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    /// Maps a kube error onto the specific variants by HTTP status code.
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(what.to_string()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(what.to_string())
            }
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(what.to_string()),
            kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
                ClusterError::Invalid(format!("{}: {}", what, ae.message))
            }
            other => ClusterError::Kube(other),
        }
    }

    /// Returns true for not-found errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Returns true when the API server refused the request itself.
    pub fn is_invalid(&self) -> bool {
        matches!(self, ClusterError::Invalid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "spec.template.spec.containers[0].volumeMounts[3].subPath: Invalid value".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_from_kube_maps_status_codes() {
        assert!(ClusterError::from_kube(api_error(404, "NotFound"), "Job default/j").is_not_found());
        assert!(matches!(
            ClusterError::from_kube(api_error(409, "AlreadyExists"), "Job default/j"),
            ClusterError::AlreadyExists(_)
        ));
        assert!(matches!(
            ClusterError::from_kube(api_error(409, "Conflict"), "ImageBuild default/ib"),
            ClusterError::Conflict(_)
        ));
        assert!(matches!(
            ClusterError::from_kube(api_error(500, "InternalError"), "Job default/j"),
            ClusterError::Kube(_)
        ));
    }

    #[test]
    fn test_rejected_requests_are_invalid() {
        for code in [400, 422] {
            let err = ClusterError::from_kube(api_error(code, "Invalid"), "Job default/j");
            assert!(err.is_invalid(), "code {code}");
            assert!(err.to_string().contains("subPath"));
        }
    }
}
