//! Builder Job construction.
//!
//! Turns an ImageBuild into the `batch/v1` Job that runs the
//! `image-builder` process. Construction is pure: the same ImageBuild and
//! configuration always produce the same Job, and nothing here talks to the
//! API server.

use std::collections::BTreeMap;

use crds::contract::{
    CONTAINERS_STORAGE_PATH, ENV_ANSIBLE_EXTRA_VARS, ENV_ARCHITECTURE, ENV_BASE_IMAGE, ENV_GIT_BRANCH,
    ENV_GIT_REPO, ENV_OUTPUT_FILENAME, ENV_OUTPUT_FORMATS, ENV_PLAYBOOK, OUTPUT_MOUNT_PATH,
    PULL_SECRET_MOUNT_PATH, SOURCE_MOUNT_PATH,
};
use crds::{ConditionType, ImageBuild, OutputDestination, Provisioner, PvcOutput, SpecError};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource, PodSecurityContext,
    PodSpec, PodTemplateSpec, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use thiserror::Error;

use crate::config::{DEFAULT_BUILDER_IMAGE, DEFAULT_PULL_POLICY};

/// Prefix of every builder Job name
pub const BUILDER_JOB_PREFIX: &str = "imgbldr-";
/// Name of the single container in the builder pod
pub const BUILDER_CONTAINER_NAME: &str = "builder";
/// `app.kubernetes.io/managed-by` value stamped on builder Jobs
pub const MANAGED_BY: &str = "imagebuild-controller";
/// Label carrying the owning ImageBuild's name
pub const IMAGE_BUILD_LABEL: &str = "bib.cluster.x-k8s.io/imagebuild";

/// Longest label value Kubernetes accepts; Job names end up in the pod's `job-name` label
const MAX_LABEL_VALUE_LEN: usize = 63;
/// Hex digits of the hash suffix on shortened names
const NAME_HASH_LEN: usize = 10;

const VOLUME_CONTAINERS_STORAGE: &str = "containers-storage";
const VOLUME_PULL_SECRET: &str = "baseimage-pull-secret";
const VOLUME_SOURCE: &str = "source-repo";
const VOLUME_OUTPUT: &str = "output-pvc";

/// Settings of the builder container that come from controller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderJobConfig {
    pub image: String,
    pub image_pull_policy: String,
}

impl Default for BuilderJobConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_BUILDER_IMAGE.to_string(),
            image_pull_policy: DEFAULT_PULL_POLICY.to_string(),
        }
    }
}

/// Reasons an ImageBuild cannot be turned into a builder Job
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    #[error("ImageBuild has no name")]
    MissingName,

    #[error("ImageBuild has no namespace")]
    MissingNamespace,

    #[error("ImageBuild has no uid, cannot set owner reference")]
    MissingUid,

    #[error("spec.baseImage must not be empty")]
    EmptyBaseImage,

    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] SpecError),

    /// The provisioner variant exists in the API but the builder cannot run it
    #[error("provisioner {0:?} is not supported by the builder")]
    UnsupportedProvisioner(&'static str),

    /// The output destination exists in the API but the builder cannot write to it
    #[error("output destination {0:?} is not supported by the builder")]
    UnsupportedOutput(&'static str),

    /// An accepted field the builder has no way to honour
    #[error("spec.provisioner.{0} is not supported by the builder")]
    UnsupportedProvisionerOption(&'static str),

    #[error("spec.output.{0} is not supported by the builder")]
    UnsupportedOutputOption(&'static str),

    #[error("spec.output.pvc.subPath {0:?} must stay inside the claim")]
    InvalidSubPath(String),

    #[error("spec.provisioner.ansible.extraVars could not be encoded: {0}")]
    ExtraVars(String),
}

impl JobError {
    /// True when the ImageBuild asks for something the builder does not implement.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            JobError::UnsupportedProvisioner(_)
                | JobError::UnsupportedProvisionerOption(_)
                | JobError::UnsupportedOutput(_)
                | JobError::UnsupportedOutputOption(_)
        )
    }

    /// Condition describing the part of the spec that caused the failure, if any.
    pub fn affected_condition(&self) -> Option<ConditionType> {
        match self {
            JobError::EmptyBaseImage => Some(ConditionType::BaseImageReady),
            JobError::UnsupportedProvisioner(_)
            | JobError::UnsupportedProvisionerOption(_)
            | JobError::ExtraVars(_) => Some(ConditionType::ProvisionerReady),
            JobError::UnsupportedOutput(_) | JobError::UnsupportedOutputOption(_) | JobError::InvalidSubPath(_) => {
                Some(ConditionType::OutputReady)
            }
            JobError::MissingName | JobError::MissingNamespace | JobError::MissingUid | JobError::InvalidSpec(_) => {
                None
            }
        }
    }
}

/// Deterministic name of the builder Job for an ImageBuild.
///
/// Shortened with a hash suffix when it would not fit in a label value.
pub fn builder_job_name(image_build_name: &str) -> String {
    fit_label_value(&format!("{}{}", BUILDER_JOB_PREFIX, image_build_name))
}

/// Returns `value` unchanged when it fits in a label value, otherwise a
/// prefix of it followed by `-` and a SHA-256 derived suffix.
fn fit_label_value(value: &str) -> String {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value.to_string();
    }
    let digest = ring::digest::digest(&ring::digest::SHA256, value.as_bytes());
    let suffix = digest.as_ref()[..NAME_HASH_LEN / 2]
        .iter()
        .fold(String::with_capacity(NAME_HASH_LEN), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        });
    let head: String = value.chars().take(MAX_LABEL_VALUE_LEN - NAME_HASH_LEN - 1).collect();
    format!("{}-{}", head.trim_end_matches(['-', '.', '_']), suffix)
}

/// Claim-relative directory for the artifacts. Leading and trailing slashes
/// are dropped; `..` components are rejected.
pub fn pvc_sub_path(pvc: &PvcOutput) -> Result<Option<String>, JobError> {
    let Some(raw) = pvc.sub_path.as_deref() else {
        return Ok(None);
    };
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.split('/').any(|c| c == "..") {
        return Err(JobError::InvalidSubPath(raw.to_string()));
    }
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

/// Base name of the produced artifacts: `spec.output.imageName`, falling
/// back to the ImageBuild name.
pub fn output_filename(image_build: &ImageBuild) -> Result<String, JobError> {
    match image_build.spec.output.image_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => image_build.metadata.name.clone().ok_or(JobError::MissingName),
    }
}

/// Location of the rootfs archive once the build has finished.
pub fn output_url(image_build: &ImageBuild) -> Result<Option<String>, JobError> {
    let filename = output_filename(image_build)?;
    let url = match image_build.spec.output.destination()? {
        OutputDestination::Pvc(pvc) => {
            let dir = match pvc_sub_path(pvc)? {
                Some(sub) => format!("{}/{}", pvc.name, sub),
                None => pvc.name.clone(),
            };
            Some(format!("pvc://{}/{}.tar.gz", dir, filename))
        }
        OutputDestination::ObjectStorage(_) | OutputDestination::Registry(_) => None,
    };
    Ok(url)
}

/// Builds the builder Job for an ImageBuild.
///
/// The returned Job carries no owner reference; see [`set_owner`].
pub fn construct_builder_job(image_build: &ImageBuild, config: &BuilderJobConfig) -> Result<Job, JobError> {
    let name = image_build.metadata.name.as_deref().ok_or(JobError::MissingName)?;
    let namespace = image_build.metadata.namespace.as_deref().ok_or(JobError::MissingNamespace)?;
    let spec = &image_build.spec;

    if spec.base_image.trim().is_empty() {
        return Err(JobError::EmptyBaseImage);
    }

    let formats: Vec<&str> = spec
        .output
        .requested_formats()
        .into_iter()
        .map(|f| f.as_str())
        .collect();

    let mut env = vec![
        env_var(ENV_BASE_IMAGE, &spec.base_image),
        env_var(ENV_ARCHITECTURE, spec.arch.as_str()),
        env_var(ENV_OUTPUT_FORMATS, &formats.join(",")),
    ];
    let mut volumes = vec![empty_dir(VOLUME_CONTAINERS_STORAGE)];
    let mut mounts = vec![mount(VOLUME_CONTAINERS_STORAGE, CONTAINERS_STORAGE_PATH)];

    if let Some(secret) = spec.base_image_pull_secret_name.as_deref().filter(|s| !s.is_empty()) {
        volumes.push(Volume {
            name: VOLUME_PULL_SECRET.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            read_only: Some(true),
            ..mount(VOLUME_PULL_SECRET, PULL_SECRET_MOUNT_PATH)
        });
    }

    let provisioner = match &spec.provisioner {
        Some(p) => p.variant()?,
        None => None,
    };
    match provisioner {
        None => {}
        Some(Provisioner::Ansible(ansible)) => {
            if ansible.credentials_secret_name.as_deref().is_some_and(|s| !s.is_empty()) {
                return Err(JobError::UnsupportedProvisionerOption("ansible.credentialsSecretName"));
            }
            env.push(env_var(ENV_GIT_REPO, &ansible.repo));
            env.push(env_var(ENV_GIT_BRANCH, &ansible.branch));
            env.push(env_var(ENV_PLAYBOOK, &ansible.playbook));
            if let Some(extra) = &ansible.extra_vars {
                let encoded = serde_json::to_string(extra).map_err(|e| JobError::ExtraVars(e.to_string()))?;
                env.push(env_var(ENV_ANSIBLE_EXTRA_VARS, &encoded));
            }
            volumes.push(empty_dir(VOLUME_SOURCE));
            mounts.push(mount(VOLUME_SOURCE, SOURCE_MOUNT_PATH));
        }
        Some(other @ Provisioner::Packer(_)) => {
            return Err(JobError::UnsupportedProvisioner(other.kind()));
        }
    }

    match spec.output.destination()? {
        OutputDestination::Pvc(pvc) => {
            if pvc.create_if_missing {
                return Err(JobError::UnsupportedOutputOption("pvc.createIfMissing"));
            }
            env.push(env_var(ENV_OUTPUT_FILENAME, &output_filename(image_build)?));
            volumes.push(pvc_volume(pvc));
            mounts.push(VolumeMount {
                sub_path: pvc_sub_path(pvc)?,
                ..mount(VOLUME_OUTPUT, OUTPUT_MOUNT_PATH)
            });
        }
        other @ (OutputDestination::ObjectStorage(_) | OutputDestination::Registry(_)) => {
            return Err(JobError::UnsupportedOutput(other.kind()));
        }
    }

    let labels = BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        (IMAGE_BUILD_LABEL.to_string(), fit_label_value(name)),
    ]);

    let container = Container {
        name: BUILDER_CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        node_selector: Some(BTreeMap::from([(
            "kubernetes.io/arch".to_string(),
            spec.arch.as_str().to_string(),
        )])),
        restart_policy: Some("Never".to_string()),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        }),
        containers: vec![container],
        volumes: Some(volumes),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(builder_job_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            // A failed build is terminal; retries happen by recreating the ImageBuild
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Makes `image_build` the controlling owner of `job`, so deleting the
/// ImageBuild garbage-collects the Job and Job events re-trigger the owner.
pub fn set_owner(job: &mut Job, image_build: &ImageBuild) -> Result<(), JobError> {
    let uid = image_build.metadata.uid.clone().ok_or(JobError::MissingUid)?;
    let name = image_build.metadata.name.clone().ok_or(JobError::MissingName)?;
    job.metadata.owner_references = Some(vec![OwnerReference {
        api_version: ImageBuild::api_version(&()).to_string(),
        kind: ImageBuild::kind(&()).to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    Ok(())
}

fn true_condition<'a>(job: &'a Job, type_: &str) -> Option<&'a JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == type_ && c.status == "True"))
}

/// Check if a Job has completed successfully
pub fn is_job_complete(job: &Job) -> bool {
    true_condition(job, "Complete").is_some()
}

/// Reason and message of a failed Job's `Failed` condition
pub fn job_failure(job: &Job) -> Option<(Option<String>, Option<String>)> {
    true_condition(job, "Failed").map(|c| (c.reason.clone(), c.message.clone()))
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn pvc_volume(pvc: &PvcOutput) -> Volume {
    Volume {
        name: VOLUME_OUTPUT.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: pvc.name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}
