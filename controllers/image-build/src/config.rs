//! Controller configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ControllerError;
use crate::job::BuilderJobConfig;

/// Builder image used when `BUILDER_IMAGE` is unset
pub const DEFAULT_BUILDER_IMAGE: &str = "ghcr.io/zarcen/bib-operator/builder:0.1.1";
/// Image pull policy used when `BUILDER_IMAGE_PULL_POLICY` is unset
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

const PULL_POLICIES: [&str; 3] = ["Always", "IfNotPresent", "Never"];

/// Runtime configuration of the ImageBuild Controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Image and pull policy of the builder container
    pub builder: BuilderJobConfig,
    /// Namespace to watch, all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Deadline for a single reconciliation
    pub reconcile_timeout: Duration,
    /// Maximum number of ImageBuilds reconciled concurrently
    pub concurrency: u16,
    /// Quiet period before a burst of events triggers a reconciliation
    pub debounce: Duration,
    /// Listen address of the health probe server
    pub health_addr: SocketAddr,
    /// First retry delay after a transient failure
    pub backoff_min: Duration,
    /// Upper bound for retry delays
    pub backoff_max: Duration,
}

impl ControllerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let image = get("BUILDER_IMAGE").unwrap_or_else(|| DEFAULT_BUILDER_IMAGE.to_string());
        let image_pull_policy =
            get("BUILDER_IMAGE_PULL_POLICY").unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string());
        if !PULL_POLICIES.contains(&image_pull_policy.as_str()) {
            return Err(ControllerError::InvalidConfig(format!(
                "BUILDER_IMAGE_PULL_POLICY must be one of {}, got {:?}",
                PULL_POLICIES.join(", "),
                image_pull_policy
            )));
        }

        let reconcile_timeout = Duration::from_secs(parse_number(&get, "RECONCILE_TIMEOUT_SECS", 60)?);
        let debounce = Duration::from_secs(parse_number(&get, "RECONCILE_DEBOUNCE_SECS", 1)?);
        let concurrency = parse_number(&get, "RECONCILE_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if reconcile_timeout.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        let health_addr = get("HEALTH_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8081".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ControllerError::InvalidConfig(format!("HEALTH_ADDR: {}", e)))?;

        Ok(Self {
            builder: BuilderJobConfig {
                image,
                image_pull_policy,
            },
            watch_namespace: get("WATCH_NAMESPACE"),
            reconcile_timeout,
            concurrency,
            debounce,
            health_addr,
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        })
    }
}

fn parse_number<T, G>(get: &G, key: &str, default: T) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}
