//! Mock ClusterClient for unit testing
//!
//! Keeps ImageBuilds and Jobs in memory and emulates the API server
//! behaviour the reconciler depends on: resourceVersion conflicts on
//! finalizer writes, finalizer-gated deletion, owner-reference cascade and
//! Jobs that linger while terminating. Every successful mutating call is
//! recorded as a [`ClusterEvent`].

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crds::{ImageBuild, ImageBuildStatus};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deletion_time() -> Option<Time> {
    serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).ok()
}

/// Mutating calls observed by the mock, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    FinalizerAdded { namespace: String, name: String },
    FinalizerRemoved { namespace: String, name: String },
    StatusPatched { namespace: String, name: String },
    JobCreated { namespace: String, name: String },
    JobDeleted { namespace: String, name: String },
}

/// Trait operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetImageBuild,
    AddFinalizer,
    RemoveFinalizer,
    PatchStatus,
    GetJob,
    CreateJob,
    DeleteJob,
}

#[derive(Debug, Clone)]
enum Injected {
    Error(String),
    Rejected(String),
}

/// Mock ClusterClient for testing
#[derive(Clone, Debug, Default)]
pub struct MockClusterClient {
    image_builds: Arc<Mutex<HashMap<Key, ImageBuild>>>,
    jobs: Arc<Mutex<HashMap<Key, Job>>>,
    events: Arc<Mutex<Vec<ClusterEvent>>>,
    failures: Arc<Mutex<HashMap<Operation, Injected>>>,
    stalled: Arc<Mutex<HashSet<Operation>>>,
    hold_job_deletions: Arc<Mutex<bool>>,
    next_version: Arc<Mutex<u64>>,
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_version(&self) -> String {
        let mut v = lock(&self.next_version);
        *v += 1;
        v.to_string()
    }

    async fn check_failure(&self, op: Operation) -> Result<(), ClusterError> {
        let stalled = lock(&self.stalled).contains(&op);
        if stalled {
            std::future::pending::<()>().await;
        }
        let injected = lock(&self.failures).remove(&op);
        match injected {
            Some(Injected::Error(msg)) => Err(ClusterError::Api(msg)),
            Some(Injected::Rejected(msg)) => Err(ClusterError::Invalid(msg)),
            None => Ok(()),
        }
    }

    fn record(&self, event: ClusterEvent) {
        lock(&self.events).push(event);
    }

    /// Store an ImageBuild (for test setup). Assigns uid, resourceVersion
    /// and generation when missing.
    pub fn add_image_build(&self, mut image_build: ImageBuild) {
        let namespace = image_build.namespace().unwrap_or_else(|| "default".to_string());
        let name = image_build.name_any();
        image_build.metadata.namespace = Some(namespace.clone());
        if image_build.metadata.uid.is_none() {
            image_build.metadata.uid = Some(format!("uid-{}-{}", namespace, name));
        }
        if image_build.metadata.generation.is_none() {
            image_build.metadata.generation = Some(1);
        }
        image_build.metadata.resource_version = Some(self.bump_version());
        lock(&self.image_builds).insert(key(&namespace, &name), image_build);
    }

    /// Current stored ImageBuild
    pub fn image_build(&self, namespace: &str, name: &str) -> Option<ImageBuild> {
        lock(&self.image_builds).get(&key(namespace, name)).cloned()
    }

    /// Current stored Job
    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        lock(&self.jobs).get(&key(namespace, name)).cloned()
    }

    /// Store a Job directly, bypassing `create_job` (for test setup)
    pub fn insert_job(&self, namespace: &str, mut job: Job) {
        job.metadata.namespace = Some(namespace.to_string());
        lock(&self.jobs).insert(key(namespace, &job.name_any()), job);
    }

    /// Overwrite the status of a stored Job, simulating the Job controller
    pub fn set_job_status(&self, namespace: &str, name: &str, status: JobStatus) {
        if let Some(job) = lock(&self.jobs).get_mut(&key(namespace, name)) {
            job.status = Some(status);
        }
    }

    /// Simulate a user deleting the ImageBuild. Objects without finalizers
    /// are removed immediately.
    pub fn mark_for_deletion(&self, namespace: &str, name: &str) {
        let uid = {
            let mut store = lock(&self.image_builds);
            let Some(ib) = store.get_mut(&key(namespace, name)) else {
                return;
            };
            ib.metadata.deletion_timestamp = deletion_time();
            ib.metadata.resource_version = Some(self.bump_version());
            if !ib.finalizers().is_empty() {
                return;
            }
            let uid = ib.uid();
            store.remove(&key(namespace, name));
            uid
        };
        if let Some(uid) = uid {
            self.collect_garbage(&uid);
        }
    }

    /// When enabled, deleted Jobs stay in the store with a deletion
    /// timestamp until [`complete_job_deletions`](Self::complete_job_deletions)
    pub fn hold_job_deletions(&self, hold: bool) {
        *lock(&self.hold_job_deletions) = hold;
    }

    /// Remove every Job that is terminating
    pub fn complete_job_deletions(&self) {
        lock(&self.jobs).retain(|_, job| job.metadata.deletion_timestamp.is_none());
    }

    /// Fail the next call of `op` with a [`ClusterError::Api`]
    pub fn fail_next(&self, op: Operation, message: impl Into<String>) {
        lock(&self.failures).insert(op, Injected::Error(message.into()));
    }

    /// Make the next call of `op` fail the way the API server rejects an
    /// invalid object (HTTP 422)
    pub fn reject_next(&self, op: Operation, message: impl Into<String>) {
        lock(&self.failures).insert(op, Injected::Rejected(message.into()));
    }

    /// Make every call of `op` hang forever
    pub fn stall(&self, op: Operation) {
        lock(&self.stalled).insert(op);
    }

    /// All recorded mutating calls
    pub fn events(&self) -> Vec<ClusterEvent> {
        lock(&self.events).clone()
    }

    /// Number of recorded mutating calls
    pub fn mutation_count(&self) -> usize {
        lock(&self.events).len()
    }

    fn collect_garbage(&self, owner_uid: &str) {
        lock(&self.jobs).retain(|_, job| {
            !job.owner_references()
                .iter()
                .any(|r| r.uid == owner_uid)
        });
    }

    fn write_finalizers(
        &self,
        image_build: &ImageBuild,
        finalizers: Vec<String>,
    ) -> Result<(), ClusterError> {
        let namespace = image_build.namespace().unwrap_or_default();
        let name = image_build.name_any();
        let what = format!("ImageBuild {}/{}", namespace, name);

        let removed_uid = {
            let mut store = lock(&self.image_builds);
            let Some(stored) = store.get_mut(&key(&namespace, &name)) else {
                return Err(ClusterError::NotFound(what));
            };
            if let Some(rv) = image_build.resource_version() {
                if stored.resource_version().as_deref() != Some(rv.as_str()) {
                    return Err(ClusterError::Conflict(what));
                }
            }
            stored.metadata.finalizers = if finalizers.is_empty() {
                None
            } else {
                Some(finalizers)
            };
            stored.metadata.resource_version = Some(self.bump_version());

            if stored.is_being_deleted() && stored.finalizers().is_empty() {
                let uid = stored.uid();
                store.remove(&key(&namespace, &name));
                uid
            } else {
                None
            }
        };
        if let Some(uid) = removed_uid {
            self.collect_garbage(&uid);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_image_build(&self, namespace: &str, name: &str) -> Result<Option<ImageBuild>, ClusterError> {
        self.check_failure(Operation::GetImageBuild).await?;
        Ok(self.image_build(namespace, name))
    }

    async fn add_finalizer(&self, image_build: &ImageBuild, finalizer: &str) -> Result<(), ClusterError> {
        self.check_failure(Operation::AddFinalizer).await?;
        let mut finalizers = image_build.finalizers().to_vec();
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
        self.write_finalizers(image_build, finalizers)?;
        self.record(ClusterEvent::FinalizerAdded {
            namespace: image_build.namespace().unwrap_or_default(),
            name: image_build.name_any(),
        });
        Ok(())
    }

    async fn remove_finalizer(&self, image_build: &ImageBuild, finalizer: &str) -> Result<(), ClusterError> {
        self.check_failure(Operation::RemoveFinalizer).await?;
        let finalizers: Vec<String> = image_build
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.write_finalizers(image_build, finalizers)?;
        self.record(ClusterEvent::FinalizerRemoved {
            namespace: image_build.namespace().unwrap_or_default(),
            name: image_build.name_any(),
        });
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &ImageBuildStatus) -> Result<(), ClusterError> {
        self.check_failure(Operation::PatchStatus).await?;
        {
            let mut store = lock(&self.image_builds);
            let Some(stored) = store.get_mut(&key(namespace, name)) else {
                return Err(ClusterError::NotFound(format!("ImageBuild {}/{}", namespace, name)));
            };
            stored.status = Some(status.clone());
            stored.metadata.resource_version = Some(self.bump_version());
        }
        self.record(ClusterEvent::StatusPatched {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError> {
        self.check_failure(Operation::GetJob).await?;
        Ok(self.job(namespace, name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ClusterError> {
        self.check_failure(Operation::CreateJob).await?;
        let name = job.name_any();
        {
            let mut store = lock(&self.jobs);
            if store.contains_key(&key(namespace, &name)) {
                return Err(ClusterError::AlreadyExists(format!("Job {}/{}", namespace, name)));
            }
            let mut job = job.clone();
            job.metadata.namespace = Some(namespace.to_string());
            job.metadata.uid = Some(format!("uid-job-{}-{}", namespace, name));
            job.metadata.resource_version = Some(self.bump_version());
            store.insert(key(namespace, &name), job);
        }
        self.record(ClusterEvent::JobCreated {
            namespace: namespace.to_string(),
            name,
        });
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.check_failure(Operation::DeleteJob).await?;
        let hold = *lock(&self.hold_job_deletions);
        {
            let mut store = lock(&self.jobs);
            if hold {
                if let Some(job) = store.get_mut(&key(namespace, name)) {
                    job.metadata.deletion_timestamp = deletion_time();
                }
            } else {
                store.remove(&key(namespace, name));
            }
        }
        self.record(ClusterEvent::JobDeleted {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::ImageBuildSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn image_build(name: &str) -> ImageBuild {
        let spec: ImageBuildSpec = serde_json::from_value(serde_json::json!({
            "baseImage": "ubuntu:24.04",
            "output": { "pvc": { "name": "out" } }
        }))
        .unwrap();
        let mut ib = ImageBuild::new(name, spec);
        ib.metadata.namespace = Some("default".to_string());
        ib
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let mock = MockClusterClient::new();
        mock.add_image_build(image_build("a"));
        let stale = mock.image_build("default", "a").unwrap();

        mock.patch_status("default", "a", &ImageBuildStatus::default()).await.unwrap();

        let err = mock.add_finalizer(&stale, "f").await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_removing_last_finalizer_deletes_and_cascades() {
        let mock = MockClusterClient::new();
        mock.add_image_build(image_build("a"));
        let ib = mock.image_build("default", "a").unwrap();
        mock.add_finalizer(&ib, "f").await.unwrap();

        let mut job = Job::default();
        job.metadata.name = Some("imgbldr-a".to_string());
        job.metadata.owner_references = Some(vec![OwnerReference {
            uid: "uid-default-a".to_string(),
            ..Default::default()
        }]);
        mock.insert_job("default", job);

        mock.mark_for_deletion("default", "a");
        assert!(mock.image_build("default", "a").is_some());

        let ib = mock.image_build("default", "a").unwrap();
        mock.remove_finalizer(&ib, "f").await.unwrap();
        assert!(mock.image_build("default", "a").is_none());
        assert!(mock.job("default", "imgbldr-a").is_none());
    }

    #[tokio::test]
    async fn test_held_job_deletion_lingers() {
        let mock = MockClusterClient::new();
        let mut job = Job::default();
        job.metadata.name = Some("j".to_string());
        mock.insert_job("default", job);
        mock.hold_job_deletions(true);

        mock.delete_job("default", "j").await.unwrap();
        assert!(mock.job("default", "j").unwrap().metadata.deletion_timestamp.is_some());

        mock.complete_job_deletions();
        assert!(mock.job("default", "j").is_none());
    }

    #[tokio::test]
    async fn test_fail_next_fires_once() {
        let mock = MockClusterClient::new();
        mock.fail_next(Operation::GetJob, "boom");
        assert!(mock.get_job("default", "j").await.is_err());
        assert!(mock.get_job("default", "j").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reject_next_returns_invalid() {
        let mock = MockClusterClient::new();
        let mut job = Job::default();
        job.metadata.name = Some("j".to_string());
        mock.reject_next(Operation::CreateJob, "spec.template: Invalid value");

        let err = mock.create_job("default", &job).await.unwrap_err();
        assert!(err.is_invalid());
        assert!(mock.job("default", "j").is_none());
        assert_eq!(mock.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_operation_never_completes() {
        let mock = MockClusterClient::new();
        mock.stall(Operation::GetJob);
        let call = mock.get_job("default", "j");
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), call).await.is_err());
    }
}
