//! Kubernetes resource watchers.
//!
//! Drives the reconciler from `kube_runtime::Controller`: ImageBuild events
//! and events of the builder Jobs they own both map to a reconciliation of
//! the owning ImageBuild.

use crate::error::ControllerError;
use crate::job::MANAGED_BY;
use crate::reconciler::Reconciler;
use crds::ImageBuild;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{Api, ResourceExt};
use kube_runtime::{controller::{Action, Config as RuntimeConfig}, watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Watch tuning taken from the controller configuration
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub concurrency: u16,
    pub debounce: Duration,
}

fn resource_key(obj: &ImageBuild) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

async fn reconcile(obj: Arc<ImageBuild>, reconciler: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| ControllerError::InvalidResource("ImageBuild without name".to_string()))?;
    let namespace = obj
        .namespace()
        .ok_or_else(|| ControllerError::InvalidResource(format!("ImageBuild {} without namespace", name)))?;
    let key = format!("{}/{}", namespace, name);
    debug!("Reconciling ImageBuild {}", key);

    // Dropping the future on timeout cancels whatever call is in flight
    match tokio::time::timeout(
        reconciler.reconcile_timeout(),
        reconciler.reconcile_image_build(&namespace, &name),
    )
    .await
    {
        Ok(Ok(action)) => {
            reconciler.reset_backoff(&key);
            Ok(action)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ControllerError::Timeout(key)),
    }
}

fn error_policy(obj: Arc<ImageBuild>, error: &ControllerError, reconciler: Arc<Reconciler>) -> Action {
    reconciler.error_action(&resource_key(&obj), error)
}

/// Runs the ImageBuild controller until the watch stream ends or a
/// shutdown signal arrives.
pub async fn watch_image_builds(
    image_builds: Api<ImageBuild>,
    jobs: Api<Job>,
    reconciler: Arc<Reconciler>,
    settings: WatchSettings,
) -> Result<(), ControllerError> {
    info!("Starting ImageBuild watcher");

    let controller_config = RuntimeConfig::default()
        .debounce(settings.debounce)
        .concurrency(settings.concurrency);
    let job_watch = watcher::Config::default().labels(&format!("app.kubernetes.io/managed-by={}", MANAGED_BY));

    Controller::new(image_builds, watcher::Config::default())
        .owns(jobs, job_watch)
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled ImageBuild {}", obj.name),
                Err(e) => error!("ImageBuild controller error: {}", e),
            }
        })
        .await;

    info!("ImageBuild watcher stopped");
    Ok(())
}
