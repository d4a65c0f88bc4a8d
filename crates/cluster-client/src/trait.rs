//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes API calls made by the reconciler.
//! All async methods must be `Send` to work with Tokio's work-stealing runtime.

use crate::error::ClusterError;
use crds::{ImageBuild, ImageBuildStatus};
use k8s_openapi::api::batch::v1::Job;

/// Trait for cluster resource operations
///
/// Read methods return `Ok(None)` for missing objects. Each mutating method
/// is a single API call.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an ImageBuild
    async fn get_image_build(&self, namespace: &str, name: &str) -> Result<Option<ImageBuild>, ClusterError>;

    /// Add `finalizer` to the ImageBuild, guarded by its resourceVersion
    async fn add_finalizer(&self, image_build: &ImageBuild, finalizer: &str) -> Result<(), ClusterError>;

    /// Remove `finalizer` from the ImageBuild, guarded by its resourceVersion
    async fn remove_finalizer(&self, image_build: &ImageBuild, finalizer: &str) -> Result<(), ClusterError>;

    /// Replace the ImageBuild status through the status subresource
    async fn patch_status(&self, namespace: &str, name: &str, status: &ImageBuildStatus) -> Result<(), ClusterError>;

    /// Fetch a Job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ClusterError>;

    /// Delete a Job and its pods. A missing Job is not an error.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
