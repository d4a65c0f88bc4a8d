//! Builder execution contract
//!
//! Environment variables and fixed filesystem paths shared by the
//! controller (which writes them into the builder Job) and the
//! `image-builder` process (which reads them). The paths are mount
//! conventions and cannot be changed per build.

/// Source image reference (required)
pub const ENV_BASE_IMAGE: &str = "BASE_IMAGE";
/// Target architecture, `amd64` or `arm64` (required)
pub const ENV_ARCHITECTURE: &str = "ARCHITECTURE";
/// Base name for the produced artifacts
pub const ENV_OUTPUT_FILENAME: &str = "OUTPUT_FILENAME";
/// Comma separated artifact formats (`tgz`, `qcow2`)
pub const ENV_OUTPUT_FORMATS: &str = "OUTPUT_FORMATS";
/// Git repository holding the provisioning source
pub const ENV_GIT_REPO: &str = "GIT_REPO";
/// Branch of [`ENV_GIT_REPO`] to clone
pub const ENV_GIT_BRANCH: &str = "GIT_BRANCH";
/// Playbook path relative to the cloned source
pub const ENV_PLAYBOOK: &str = "PLAYBOOK";
/// JSON object passed to the playbook as extra variables
pub const ENV_ANSIBLE_EXTRA_VARS: &str = "ANSIBLE_EXTRA_VARS";

/// Directory the base image pull secret is mounted at
pub const PULL_SECRET_MOUNT_PATH: &str = "/etc/baseimage-pull-secret";
/// Key of a `kubernetes.io/dockerconfigjson` secret, i.e. the credential file name
pub const PULL_SECRET_FILE: &str = ".dockerconfigjson";
/// Scratch directory the provisioning source is cloned into
pub const SOURCE_MOUNT_PATH: &str = "/source";
/// Directory artifacts are written to
pub const OUTPUT_MOUNT_PATH: &str = "/output";
/// Backing storage for buildah containers
pub const CONTAINERS_STORAGE_PATH: &str = "/var/lib/containers/storage";

/// Archive base name used when none is supplied
pub const DEFAULT_OUTPUT_FILENAME: &str = "rootfs";
/// Branch cloned when none is supplied
pub const DEFAULT_GIT_BRANCH: &str = "main";
