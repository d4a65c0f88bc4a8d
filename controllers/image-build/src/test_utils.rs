//! Test utilities for unit testing the reconciler and job construction

use crate::config::ControllerConfig;
use crate::job::BuilderJobConfig;
use crate::reconciler::Reconciler;
use cluster_client::MockClusterClient;
use crds::{ImageBuild, ImageBuildSpec};
use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub const NAMESPACE: &str = "default";

/// ImageBuild from a JSON spec, without uid or finalizer
pub fn image_build_from(name: &str, spec: serde_json::Value) -> ImageBuild {
    let spec: ImageBuildSpec = serde_json::from_value(spec).unwrap();
    ImageBuild {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// `ubuntu:24.04` on amd64 into PVC `out`, tgz only
pub fn pvc_build(name: &str) -> ImageBuild {
    image_build_from(
        name,
        json!({
            "baseImage": "ubuntu:24.04",
            "arch": "amd64",
            "output": { "pvc": { "name": "out" }, "formats": ["tgz"] }
        }),
    )
}

/// [`pvc_build`] provisioned with an ansible playbook
pub fn ansible_build(name: &str) -> ImageBuild {
    image_build_from(
        name,
        json!({
            "baseImage": "ubuntu:24.04",
            "arch": "amd64",
            "provisioner": {
                "ansible": { "repo": "https://x/y.git", "branch": "main", "playbook": "site.yml" }
            },
            "output": { "pvc": { "name": "out" }, "formats": ["tgz"] }
        }),
    )
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        builder: BuilderJobConfig::default(),
        watch_namespace: None,
        reconcile_timeout: Duration::from_secs(5),
        concurrency: 1,
        debounce: Duration::ZERO,
        health_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        backoff_min: Duration::from_secs(5),
        backoff_max: Duration::from_secs(300),
    }
}

/// Reconciler wired to a fresh mock cluster
pub fn reconciler_with_mock() -> (Reconciler, MockClusterClient) {
    let mock = MockClusterClient::new();
    let reconciler = Reconciler::new(Arc::new(mock.clone()), &test_config());
    (reconciler, mock)
}

fn time(rfc3339: &str) -> Time {
    serde_json::from_value(json!(rfc3339)).unwrap()
}

pub fn job_running() -> JobStatus {
    JobStatus {
        active: Some(1),
        start_time: Some(time("2026-03-01T10:00:00Z")),
        ..Default::default()
    }
}

pub fn job_succeeded() -> JobStatus {
    serde_json::from_value(json!({
        "succeeded": 1,
        "startTime": "2026-03-01T10:00:00Z",
        "completionTime": "2026-03-01T10:20:00Z",
        "conditions": [
            { "type": "Complete", "status": "True" }
        ]
    }))
    .unwrap()
}

pub fn job_failed() -> JobStatus {
    serde_json::from_value(json!({
        "failed": 1,
        "startTime": "2026-03-01T10:00:00Z",
        "conditions": [
            {
                "type": "Failed",
                "status": "True",
                "reason": "BackoffLimitExceeded",
                "message": "Job has reached the specified backoff limit"
            }
        ]
    }))
    .unwrap()
}
