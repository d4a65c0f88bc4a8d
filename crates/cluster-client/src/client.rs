//! kube-rs backed implementation of [`ClusterClient`]

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crds::{ImageBuild, ImageBuildStatus};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

/// Cluster client talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Creates a new client. `field_manager` identifies the controller in
    /// managed fields.
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn image_builds(&self, namespace: &str) -> Api<ImageBuild> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    /// Writes the finalizer list with a merge patch that carries the
    /// resourceVersion, so a concurrent writer causes a 409 instead of a
    /// lost update.
    async fn write_finalizers(
        &self,
        image_build: &ImageBuild,
        finalizers: Vec<String>,
    ) -> Result<(), ClusterError> {
        let name = image_build.name_any();
        let namespace = image_build.namespace().unwrap_or_default();
        let key = format!("ImageBuild {}/{}", namespace, name);

        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": image_build.resource_version(),
            }
        });

        self.image_builds(&namespace)
            .patch(&name, &self.patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, &key))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_image_build(&self, namespace: &str, name: &str) -> Result<Option<ImageBuild>, ClusterError> {
        self.image_builds(namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("ImageBuild {}/{}", namespace, name)))
    }

    async fn add_finalizer(&self, image_build: &ImageBuild, finalizer: &str) -> Result<(), ClusterError> {
        let mut finalizers = image_build.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        self.write_finalizers(image_build, finalizers).await?;
        info!(
            imagebuild = %image_build.name_any(),
            finalizer,
            "Added finalizer"
        );
        Ok(())
    }

    async fn remove_finalizer(&self, image_build: &ImageBuild, finalizer: &str) -> Result<(), ClusterError> {
        let finalizers: Vec<String> = image_build
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();

        self.write_finalizers(image_build, finalizers).await?;
        info!(
            imagebuild = %image_build.name_any(),
            finalizer,
            "Removed finalizer"
        );
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &ImageBuildStatus) -> Result<(), ClusterError> {
        let patch = json!({ "status": status });
        self.image_builds(namespace)
            .patch_status(name, &self.patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("ImageBuild {}/{}", namespace, name)))?;
        debug!("Patched ImageBuild {}/{} status (phase {})", namespace, name, status.phase);
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError> {
        self.jobs(namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("Job {}/{}", namespace, name)))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ClusterError> {
        let name = job.name_any();
        let pp = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.jobs(namespace)
            .create(&pp, job)
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("Job {}/{}", namespace, name)))?;
        info!("Created builder Job {}/{}", namespace, name);
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        // Background propagation removes the Job's pods along with it
        match self.jobs(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("Deleted builder Job {}/{}", namespace, name);
                Ok(())
            }
            Err(e) => match ClusterError::from_kube(e, &format!("Job {}/{}", namespace, name)) {
                ClusterError::NotFound(_) => {
                    debug!("Builder Job {}/{} already gone", namespace, name);
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}
