//! Main controller implementation.
//!
//! Wires the Kubernetes client, the reconciler, the ImageBuild watcher and
//! the health probe server together and runs them until one exits.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::health::{self, HealthState};
use crate::reconciler::Reconciler;
use crate::watcher::{watch_image_builds, WatchSettings};
use cluster_client::KubeClusterClient;
use crds::ImageBuild;
use k8s_openapi::api::batch::v1::Job;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "imagebuild-controller";

/// Main controller for ImageBuild resources.
#[derive(Debug)]
pub struct Controller {
    image_build_watcher: JoinHandle<Result<(), ControllerError>>,
    health_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing ImageBuild Controller");

        let health_state = HealthState::default();
        let health_server = tokio::spawn(health::serve(config.health_addr, health_state.clone()));

        let kube_client = Client::try_default().await?;

        let (image_builds, jobs): (Api<ImageBuild>, Api<Job>) = match config.watch_namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(kube_client.clone(), ns),
                Api::namespaced(kube_client.clone(), ns),
            ),
            None => (Api::all(kube_client.clone()), Api::all(kube_client.clone())),
        };

        let cluster = KubeClusterClient::new(kube_client, FIELD_MANAGER);
        let reconciler = Arc::new(Reconciler::new(Arc::new(cluster), &config));
        let settings = WatchSettings {
            concurrency: config.concurrency,
            debounce: config.debounce,
        };

        let image_build_watcher = tokio::spawn(watch_image_builds(image_builds, jobs, reconciler, settings));
        health_state.set_ready(true);

        Ok(Self {
            image_build_watcher,
            health_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("ImageBuild Controller running");

        tokio::select! {
            result = &mut self.image_build_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("ImageBuild watcher panicked: {}", e)))??;
            }
            result = &mut self.health_server => {
                result.map_err(|e| ControllerError::Watch(format!("Health server panicked: {}", e)))??;
            }
        }

        self.health_server.abort();
        Ok(())
    }
}
