//! ImageBuild Controller
//!
//! Watches `ImageBuild` resources (`bib.cluster.x-k8s.io/v1alpha1`) and, for
//! each one, runs a single builder Job that produces the requested machine
//! image. Tracks the Job to completion and reflects its progress in the
//! ImageBuild status.

mod backoff;
mod config;
mod controller;
mod error;
mod health;
mod job;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls client needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        return Err(ControllerError::InvalidConfig(
            "a different rustls crypto provider is already installed".to_string(),
        ));
    }

    info!("Starting ImageBuild Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Builder image: {} ({})", config.builder.image, config.builder.image_pull_policy);
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Reconcile timeout: {:?}", config.reconcile_timeout);
    info!("  Concurrency: {}", config.concurrency);
    info!("  Health probes: {}", config.health_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
