//! Reconciliation logic for ImageBuild resources.
//!
//! One invocation reads the ImageBuild and its builder Job, decides the
//! next step and performs at most one mutating call (finalizer patch, Job
//! create, Job delete or status patch). Whenever a step mutates the cluster
//! the invocation ends there and asks to be requeued, so the following
//! invocation observes the persisted result before acting again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cluster_client::{ClusterClient, ClusterError};
use crds::{
    initialize_conditions, set_condition, ConditionStatus, ConditionType, ImageBuild, ImageBuildStatus,
    Phase, IMAGE_BUILD_CONDITION_TYPES, IMAGE_BUILD_FINALIZER,
};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_runtime::controller::Action;
use tracing::{debug, error, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::job::{
    builder_job_name, construct_builder_job, is_job_complete, job_failure, output_url, set_owner, BuilderJobConfig,
    JobError,
};

/// Delay before the invocation that follows a mutating call
pub const REQUEUE_AFTER_MUTATION: Duration = Duration::from_secs(1);
/// Polling interval while a deleted builder Job is still terminating
pub const JOB_TERMINATION_POLL: Duration = Duration::from_secs(5);

// Condition reasons
const REASON_JOB_RUNNING: &str = "JobRunning";
const REASON_JOB_SUCCEEDED: &str = "JobSucceeded";
const REASON_JOB_FAILED: &str = "JobFailed";
const REASON_BUILDER_JOB_NOT_READY: &str = "BuilderJobNotReady";
const REASON_JOB_REJECTED: &str = "JobRejected";
const REASON_NOT_SUPPORTED: &str = "NotSupported";
const REASON_NOT_REQUESTED: &str = "NotRequested";
const REASON_INVALID_SPEC: &str = "InvalidSpec";
const REASON_BASE_IMAGE_PULLED: &str = "BaseImagePulled";
const REASON_PROVISIONED: &str = "Provisioned";
const REASON_ARTIFACTS_WRITTEN: &str = "ArtifactsWritten";

/// Observed state of a builder Job
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    /// Pending or running
    Running { start_time: Option<DateTime<Utc>> },
    /// Finished successfully
    Succeeded {
        start_time: Option<DateTime<Utc>>,
        completion_time: Option<DateTime<Utc>>,
    },
    /// Finished unsuccessfully
    Failed { reason: String, message: String },
}

/// Classifies a builder Job by its status.
///
/// Terminal Job conditions win over counters; with `backoffLimit: 0` a
/// single failed pod is already terminal.
pub fn job_state(job: &Job) -> JobState {
    if let Some((reason, message)) = job_failure(job) {
        return JobState::Failed {
            reason: reason.unwrap_or_else(|| REASON_JOB_FAILED.to_string()),
            message: message.unwrap_or_default(),
        };
    }
    let Some(status) = job.status.as_ref() else {
        return JobState::Running { start_time: None };
    };
    let start_time = status.start_time.as_ref().and_then(to_chrono);

    if is_job_complete(job) || status.succeeded.unwrap_or(0) > 0 {
        return JobState::Succeeded {
            start_time,
            completion_time: status.completion_time.as_ref().and_then(to_chrono),
        };
    }
    if status.failed.unwrap_or(0) > 0 {
        return JobState::Failed {
            reason: REASON_JOB_FAILED.to_string(),
            message: "builder pod failed".to_string(),
        };
    }
    JobState::Running { start_time }
}

// Goes through the wire format so it holds whichever time crate k8s-openapi uses.
fn to_chrono(time: &Time) -> Option<DateTime<Utc>> {
    serde_json::to_value(time)
        .ok()
        .and_then(|v| serde_json::from_value(v).ok())
}

/// Reconciles ImageBuild resources.
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    builder: BuilderJobConfig,
    reconcile_timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    /// Per-resource retry state (namespace/name -> backoff)
    backoff_states: Arc<Mutex<HashMap<String, FibonacciBackoff>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("builder", &self.builder)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(client: Arc<dyn ClusterClient>, config: &ControllerConfig) -> Self {
        Self {
            client,
            builder: config.builder.clone(),
            reconcile_timeout: config.reconcile_timeout,
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deadline applied to a single invocation by the watcher
    pub fn reconcile_timeout(&self) -> Duration {
        self.reconcile_timeout
    }

    /// Reconciles the ImageBuild `namespace/name`.
    pub async fn reconcile_image_build(&self, namespace: &str, name: &str) -> Result<Action, ControllerError> {
        let Some(image_build) = self.client.get_image_build(namespace, name).await? else {
            debug!("ImageBuild {}/{} not found, nothing to do", namespace, name);
            return Ok(Action::await_change());
        };

        if image_build.is_being_deleted() {
            return self.reconcile_delete(&image_build, namespace, name).await;
        }

        if !image_build.has_finalizer() {
            self.client.add_finalizer(&image_build, IMAGE_BUILD_FINALIZER).await?;
            return Ok(Action::requeue(REQUEUE_AFTER_MUTATION));
        }

        let current = image_build.status.clone().unwrap_or_default();
        let mut status = current.clone();
        let now = Utc::now();
        initialize_conditions(&mut status.conditions, &IMAGE_BUILD_CONDITION_TYPES, now);
        status.observed_generation = image_build.metadata.generation;

        let job_name = builder_job_name(name);
        let action = match self.client.get_job(namespace, &job_name).await? {
            None if status.phase.is_terminal() => {
                // Finished builds are never rerun, even when their Job was removed
                debug!(
                    "ImageBuild {}/{} is {}, not recreating builder Job",
                    namespace, name, status.phase
                );
                Action::await_change()
            }
            None => {
                let job = construct_builder_job(&image_build, &self.builder).and_then(|mut job| {
                    set_owner(&mut job, &image_build)?;
                    Ok(job)
                });
                match job {
                    Ok(job) => match self.create_job(namespace, &job).await {
                        Err(ClusterError::Invalid(msg)) => {
                            error!("API server rejected builder Job for ImageBuild {}/{}: {}", namespace, name, msg);
                            set_condition(
                                &mut status.conditions,
                                ConditionType::BuilderJobReady,
                                ConditionStatus::False,
                                REASON_JOB_REJECTED,
                                msg.clone(),
                                now,
                            );
                            status.phase = status.phase.advance(Phase::Failed);
                            self.persist_status(namespace, name, &current, &status).await?;
                            return Err(ClusterError::Invalid(msg).into());
                        }
                        other => return other.map_err(Into::into),
                    },
                    Err(e) => {
                        error!("Cannot build a Job for ImageBuild {}/{}: {}", namespace, name, e);
                        mark_construction_failed(&mut status, &e, now);
                        self.persist_status(namespace, name, &current, &status).await?;
                        return Err(ControllerError::JobConstruction(e));
                    }
                }
            }
            Some(job) if job.metadata.deletion_timestamp.is_some() => {
                debug!("Builder Job {}/{} is terminating", namespace, job_name);
                Action::requeue(JOB_TERMINATION_POLL)
            }
            Some(job) => {
                observe_job(&image_build, &job_name, &job_state(&job), &mut status, now);
                Action::await_change()
            }
        };

        self.persist_status(namespace, name, &current, &status).await?;
        Ok(action)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Action, ClusterError> {
        match self.client.create_job(namespace, job).await {
            Ok(()) => {}
            // Created by an earlier invocation whose result we have not observed yet
            Err(ClusterError::AlreadyExists(what)) => debug!("{} already exists", what),
            Err(e) => return Err(e),
        }
        Ok(Action::requeue(REQUEUE_AFTER_MUTATION))
    }

    /// Deletion path: remove the builder Job, wait until it is gone, then
    /// release the finalizer.
    async fn reconcile_delete(
        &self,
        image_build: &ImageBuild,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        if !image_build.has_finalizer() {
            return Ok(Action::await_change());
        }

        let job_name = builder_job_name(name);
        match self.client.get_job(namespace, &job_name).await? {
            Some(job) if job.metadata.deletion_timestamp.is_some() => {
                debug!("Waiting for builder Job {}/{} to terminate", namespace, job_name);
                Ok(Action::requeue(JOB_TERMINATION_POLL))
            }
            Some(_) => {
                info!("ImageBuild {}/{} deleted, removing builder Job {}", namespace, name, job_name);
                self.client.delete_job(namespace, &job_name).await?;
                Ok(Action::requeue(JOB_TERMINATION_POLL))
            }
            None => {
                self.client.remove_finalizer(image_build, IMAGE_BUILD_FINALIZER).await?;
                self.reset_backoff(&format!("{}/{}", namespace, name));
                info!("Cleanup for ImageBuild {}/{} complete", namespace, name);
                Ok(Action::await_change())
            }
        }
    }

    async fn persist_status(
        &self,
        namespace: &str,
        name: &str,
        current: &ImageBuildStatus,
        desired: &ImageBuildStatus,
    ) -> Result<(), ControllerError> {
        if current == desired {
            return Ok(());
        }
        if current.phase != desired.phase {
            info!(
                "ImageBuild {}/{} phase {} -> {}",
                namespace, name, current.phase, desired.phase
            );
        }
        self.client.patch_status(namespace, name, desired).await?;
        Ok(())
    }

    /// Decides how a failed invocation is retried.
    ///
    /// Retryable errors back off per resource; anything else waits until
    /// the ImageBuild changes.
    pub fn error_action(&self, key: &str, error: &ControllerError) -> Action {
        if !error.is_retryable() {
            error!("Reconciliation of {} failed permanently: {}", key, error);
            return Action::await_change();
        }
        let delay = self.next_backoff(key);
        warn!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, error);
        Action::requeue(delay)
    }

    fn next_backoff(&self, key: &str) -> Duration {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let (min, max) = (self.backoff_min.as_secs(), self.backoff_max.as_secs());
                states
                    .entry(key.to_string())
                    .or_insert_with(|| FibonacciBackoff::new(min, max))
                    .next_backoff()
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using minimum backoff", e);
                self.backoff_min
            }
        }
    }

    /// Forgets the retry state of a resource after a successful invocation
    /// or once it is gone
    pub fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_backoffs(&self) -> usize {
        self.backoff_states.lock().map(|s| s.len()).unwrap_or_default()
    }
}

fn mark_construction_failed(status: &mut ImageBuildStatus, err: &JobError, now: DateTime<Utc>) {
    set_condition(
        &mut status.conditions,
        ConditionType::BuilderJobReady,
        ConditionStatus::False,
        REASON_BUILDER_JOB_NOT_READY,
        err.to_string(),
        now,
    );
    if let Some(affected) = err.affected_condition() {
        let reason = if err.is_unsupported() {
            REASON_NOT_SUPPORTED
        } else {
            REASON_INVALID_SPEC
        };
        set_condition(&mut status.conditions, affected, ConditionStatus::False, reason, err.to_string(), now);
    }
    status.phase = status.phase.advance(Phase::Failed);
}

/// Projects the builder Job state onto the ImageBuild status.
fn observe_job(
    image_build: &ImageBuild,
    job_name: &str,
    state: &JobState,
    status: &mut ImageBuildStatus,
    now: DateTime<Utc>,
) {
    status.builder_job_name = Some(job_name.to_string());
    let conditions = &mut status.conditions;

    match state {
        JobState::Running { start_time } => {
            status.start_time = status.start_time.or(*start_time).or(Some(now));
            set_condition(
                conditions,
                ConditionType::BuilderJobReady,
                ConditionStatus::False,
                REASON_JOB_RUNNING,
                format!("Builder job {} is running", job_name),
                now,
            );
            status.phase = status.phase.advance(Phase::Building);
        }
        JobState::Succeeded {
            start_time,
            completion_time,
        } => {
            status.start_time = status.start_time.or(*start_time).or(Some(now));
            status.completion_time = status.completion_time.or(*completion_time).or(Some(now));
            status.output_url = output_url(image_build).ok().flatten();

            set_condition(
                conditions,
                ConditionType::BaseImageReady,
                ConditionStatus::True,
                REASON_BASE_IMAGE_PULLED,
                image_build.spec.base_image.clone(),
                now,
            );
            let provisioner = image_build
                .spec
                .provisioner
                .as_ref()
                .and_then(|p| p.variant().ok().flatten());
            match provisioner {
                Some(p) => set_condition(
                    conditions,
                    ConditionType::ProvisionerReady,
                    ConditionStatus::True,
                    REASON_PROVISIONED,
                    format!("{} provisioner completed", p.kind()),
                    now,
                ),
                None => set_condition(
                    conditions,
                    ConditionType::ProvisionerReady,
                    ConditionStatus::True,
                    REASON_NOT_REQUESTED,
                    "No provisioner requested",
                    now,
                ),
            }
            set_condition(
                conditions,
                ConditionType::BuilderJobReady,
                ConditionStatus::True,
                REASON_JOB_SUCCEEDED,
                format!("Builder job {} succeeded", job_name),
                now,
            );
            set_condition(
                conditions,
                ConditionType::OutputReady,
                ConditionStatus::True,
                REASON_ARTIFACTS_WRITTEN,
                status.output_url.clone().unwrap_or_default(),
                now,
            );

            match image_build.spec.publish.as_ref().map(|p| p.target()) {
                None => {
                    set_condition(
                        conditions,
                        ConditionType::PublishReady,
                        ConditionStatus::True,
                        REASON_NOT_REQUESTED,
                        "No publish target requested",
                        now,
                    );
                    status.phase = status.phase.advance(Phase::Succeeded);
                }
                Some(Ok(target)) => {
                    set_condition(
                        conditions,
                        ConditionType::PublishReady,
                        ConditionStatus::False,
                        REASON_NOT_SUPPORTED,
                        format!("publishing to {} is not supported", target.kind()),
                        now,
                    );
                    status.phase = status.phase.advance(Phase::Publishing);
                }
                Some(Err(e)) => {
                    set_condition(
                        conditions,
                        ConditionType::PublishReady,
                        ConditionStatus::False,
                        REASON_INVALID_SPEC,
                        e.to_string(),
                        now,
                    );
                    status.phase = status.phase.advance(Phase::Publishing);
                }
            }
        }
        JobState::Failed { reason, message } => {
            status.completion_time = status.completion_time.or(Some(now));
            set_condition(
                conditions,
                ConditionType::BuilderJobReady,
                ConditionStatus::False,
                reason,
                message.clone(),
                now,
            );
            status.phase = status.phase.advance(Phase::Failed);
        }
    }
}
