//! ImageBuild Custom Resource Definition
//!
//! Describes a desired machine image: the base container image to start
//! from, an optional provisioner that mutates its filesystem, where the
//! resulting artifacts go, and an optional infrastructure target to
//! publish them to.
//!
//! The provisioner, output destination and publish target are one-of
//! groups. On the wire they keep the familiar "object with exactly one key
//! set" shape (enforced by CEL rules in the generated schema); in Rust they
//! are resolved into borrowed sum types ([`Provisioner`],
//! [`OutputDestination`], [`PublishTarget`]) so every consumer has to match
//! every variant.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::status::ImageBuildStatus;

/// Finalizer guarding an ImageBuild until its builder Job is gone.
pub const IMAGE_BUILD_FINALIZER: &str = "bib.cluster.x-k8s.io/imagebuild";

/// API group served by the operator.
pub const API_GROUP: &str = "bib.cluster.x-k8s.io";

/// ImageBuildSpec defines the desired state of an ImageBuild
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "bib.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ImageBuild",
    namespaced,
    status = "ImageBuildStatus",
    shortname = "ib",
    printcolumn = r#"{"name":"BaseImage","type":"string","jsonPath":".spec.baseImage"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildSpec {
    /// Target architecture for the build
    #[serde(default)]
    pub arch: Architecture,

    /// Starting container image for the build
    pub base_image: String,

    /// Name of a `kubernetes.io/dockerconfigjson` secret used to pull the base image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image_pull_secret_name: Option<String>,

    /// Build steps applied to the base image filesystem.
    /// When omitted the base image filesystem is exported as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<ProvisionerSpec>,

    /// Where the built artifacts are stored
    pub output: OutputSpec,

    /// Infrastructure provider to publish the image to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishSpec>,
}

impl ImageBuild {
    /// Returns true when the operator finalizer is present on the resource.
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == IMAGE_BUILD_FINALIZER))
    }

    /// Returns true once the API server has marked the resource for deletion.
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Target CPU architecture
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    Amd64,
    Arm64,
}

impl Architecture {
    /// Value used for the `kubernetes.io/arch` node label and by buildah.
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Architecture::Amd64),
            "arm64" => Ok(Architecture::Arm64),
            other => Err(SpecError::UnknownValue {
                field: "arch",
                value: other.to_string(),
            }),
        }
    }
}

// --- Provisioner ---

/// Provisioning method. At most one variant may be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-validations" = [{
    "rule": "(has(self.ansible) ? 1 : 0) + (has(self.packer) ? 1 : 0) <= 1",
    "message": "at most one of ansible or packer can be specified"
}]))]
pub struct ProvisionerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible: Option<AnsibleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packer: Option<PackerSpec>,
}

/// Ansible-based provisioning
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnsibleSpec {
    /// Git repository containing the playbooks
    pub repo: String,

    /// Secret used to pull the repository (`kubernetes.io/ssh-auth` or `kubernetes.io/basic-auth`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_name: Option<String>,

    /// Branch to check out
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Playbook path inside the repository
    pub playbook: String,

    /// Extra variables passed to the playbook (`--extra-vars`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub extra_vars: Option<serde_json::Value>,
}

/// Packer-based provisioning (schema only, no worker support yet)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackerSpec {
    pub repo: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Packer template (HCL or JSON) inside the repository
    pub template_path: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    })
}

/// Resolved provisioner variant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Provisioner<'a> {
    Ansible(&'a AnsibleSpec),
    Packer(&'a PackerSpec),
}

impl Provisioner<'_> {
    /// Variant key as it appears in the resource
    pub fn kind(&self) -> &'static str {
        match self {
            Provisioner::Ansible(_) => "ansible",
            Provisioner::Packer(_) => "packer",
        }
    }
}

impl ProvisionerSpec {
    /// Resolves the provisioner variant. An empty block means no provisioner.
    pub fn variant(&self) -> Result<Option<Provisioner<'_>>, SpecError> {
        pick_variant(
            "provisioner",
            [
                ("ansible", self.ansible.as_ref().map(Provisioner::Ansible)),
                ("packer", self.packer.as_ref().map(Provisioner::Packer)),
            ],
        )
    }
}

// --- Output ---

/// Artifact format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `.tar.gz` rootfs archive
    Tgz,
    /// QEMU copy-on-write v2 disk image
    Qcow2,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Tgz => "tgz",
            OutputFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tgz" => Ok(OutputFormat::Tgz),
            "qcow2" => Ok(OutputFormat::Qcow2),
            other => Err(SpecError::UnknownValue {
                field: "output.formats",
                value: other.to_string(),
            }),
        }
    }
}

/// Destination for the built artifacts. Exactly one destination must be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-validations" = [{
    "rule": "(has(self.pvc) ? 1 : 0) + (has(self.objectStorage) ? 1 : 0) + (has(self.registry) ? 1 : 0) == 1",
    "message": "exactly one of pvc, objectStorage, or registry must be specified"
}]))]
pub struct OutputSpec {
    /// Base name for the output files (e.g. "ubuntu-2404-kube-1.30").
    /// Not used by the registry destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcOutput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage: Option<ObjectStorageOutput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryOutput>,

    /// Artifact formats to produce
    #[serde(default = "default_formats")]
    pub formats: Vec<OutputFormat>,
}

fn default_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Tgz, OutputFormat::Qcow2]
}

/// PersistentVolumeClaim destination
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcOutput {
    /// Claim name in the ImageBuild's namespace
    pub name: String,

    /// Path inside the claim where artifacts are written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,

    /// Create the claim when it does not exist
    #[serde(default)]
    pub create_if_missing: bool,
}

/// S3-compatible bucket destination
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageOutput {
    pub bucket: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Secret holding `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`
    pub credentials_secret_name: String,
}

/// Container registry destination
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryOutput {
    /// Full image reference, e.g. "quay.io/my-org/my-image:latest"
    pub destination: String,

    /// `kubernetes.io/dockerconfigjson` secret for registry authentication
    pub pull_secret_name: String,
}

/// Resolved output destination
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputDestination<'a> {
    Pvc(&'a PvcOutput),
    ObjectStorage(&'a ObjectStorageOutput),
    Registry(&'a RegistryOutput),
}

impl OutputDestination<'_> {
    /// Variant key as it appears in the resource
    pub fn kind(&self) -> &'static str {
        match self {
            OutputDestination::Pvc(_) => "pvc",
            OutputDestination::ObjectStorage(_) => "objectStorage",
            OutputDestination::Registry(_) => "registry",
        }
    }
}

impl OutputSpec {
    /// Resolves the single configured destination.
    pub fn destination(&self) -> Result<OutputDestination<'_>, SpecError> {
        pick_variant(
            "output",
            [
                ("pvc", self.pvc.as_ref().map(OutputDestination::Pvc)),
                (
                    "objectStorage",
                    self.object_storage.as_ref().map(OutputDestination::ObjectStorage),
                ),
                ("registry", self.registry.as_ref().map(OutputDestination::Registry)),
            ],
        )?
        .ok_or(SpecError::MissingVariant {
            field: "output",
            candidates: "pvc, objectStorage, registry",
        })
    }

    /// Requested formats with duplicates removed, in request order.
    pub fn requested_formats(&self) -> Vec<OutputFormat> {
        let mut formats = Vec::with_capacity(self.formats.len());
        for format in &self.formats {
            if !formats.contains(format) {
                formats.push(*format);
            }
        }
        formats
    }
}

// --- Publish ---

/// Infrastructure provider to publish to. Exactly one target must be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-validations" = [{
    "rule": "(has(self.aws) ? 1 : 0) + (has(self.maas) ? 1 : 0) == 1",
    "message": "exactly one of aws or maas must be specified"
}]))]
pub struct PublishSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsPublishSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maas: Option<MaasPublishSpec>,
}

/// Publish as an AMI through the AWS VM import flow
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsPublishSpec {
    pub region: String,
    pub ami_name: String,
    /// Instance type used by the import task, e.g. "t3.small"
    pub instance_type: String,
    /// Bucket used to stage the qcow2 image during import
    #[serde(rename = "sourceS3Bucket")]
    pub source_s3_bucket: String,
    pub credentials_secret_name: String,
}

/// Publish to a MaaS server
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaasPublishSpec {
    /// MaaS API endpoint, e.g. "http://maas.example.com/MAAS"
    pub api_url: String,
    pub image_name: String,
    /// Secret holding `MAAS_API_KEY`
    pub credentials_secret_name: String,
}

/// Resolved publish target
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PublishTarget<'a> {
    Aws(&'a AwsPublishSpec),
    Maas(&'a MaasPublishSpec),
}

impl PublishTarget<'_> {
    /// Variant key as it appears in the resource
    pub fn kind(&self) -> &'static str {
        match self {
            PublishTarget::Aws(_) => "aws",
            PublishTarget::Maas(_) => "maas",
        }
    }
}

impl PublishSpec {
    /// Resolves the single configured publish target.
    pub fn target(&self) -> Result<PublishTarget<'_>, SpecError> {
        pick_variant(
            "publish",
            [
                ("aws", self.aws.as_ref().map(PublishTarget::Aws)),
                ("maas", self.maas.as_ref().map(PublishTarget::Maas)),
            ],
        )?
        .ok_or(SpecError::MissingVariant {
            field: "publish",
            candidates: "aws, maas",
        })
    }
}

/// Errors raised while resolving one-of groups and enum values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    /// None of the variants of a required one-of group is set
    #[error("{field}: exactly one of {candidates} must be specified")]
    MissingVariant {
        field: &'static str,
        candidates: &'static str,
    },

    /// More than one variant of a one-of group is set
    #[error("{field}: only one variant may be specified, found {}", .set.join(", "))]
    ConflictingVariants {
        field: &'static str,
        set: Vec<&'static str>,
    },

    /// Value outside the accepted enumeration
    #[error("{field}: unsupported value {value:?}")]
    UnknownValue { field: &'static str, value: String },
}

/// Returns the single populated variant, rejecting more than one.
fn pick_variant<T, const N: usize>(
    field: &'static str,
    candidates: [(&'static str, Option<T>); N],
) -> Result<Option<T>, SpecError> {
    let mut chosen = None;
    let mut set = Vec::new();
    for (name, value) in candidates {
        if let Some(value) = value {
            set.push(name);
            if chosen.is_none() {
                chosen = Some(value);
            }
        }
    }
    if set.len() > 1 {
        return Err(SpecError::ConflictingVariants { field, set });
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pvc_output() -> OutputSpec {
        serde_json::from_value(json!({ "pvc": { "name": "out" } })).unwrap()
    }

    #[test]
    fn test_spec_defaults() {
        let spec: ImageBuildSpec = serde_json::from_value(json!({
            "baseImage": "ubuntu:24.04",
            "output": { "pvc": { "name": "out" } }
        }))
        .unwrap();

        assert_eq!(spec.arch, Architecture::Amd64);
        assert_eq!(spec.output.formats, vec![OutputFormat::Tgz, OutputFormat::Qcow2]);
        assert!(spec.provisioner.is_none());
        assert!(spec.publish.is_none());
    }

    #[test]
    fn test_ansible_branch_defaults_to_main() {
        let spec: ProvisionerSpec = serde_json::from_value(json!({
            "ansible": { "repo": "https://x/y.git", "playbook": "site.yml" }
        }))
        .unwrap();

        match spec.variant().unwrap() {
            Some(Provisioner::Ansible(ansible)) => assert_eq!(ansible.branch, "main"),
            other => panic!("expected ansible provisioner, got {:?}", other),
        }
    }

    #[test]
    fn test_output_destination_resolves_single_variant() {
        let output = pvc_output();
        match output.destination().unwrap() {
            OutputDestination::Pvc(pvc) => assert_eq!(pvc.name, "out"),
            other => panic!("expected pvc destination, got {}", other.kind()),
        }
    }

    #[test]
    fn test_output_destination_rejects_multiple_variants() {
        let output: OutputSpec = serde_json::from_value(json!({
            "pvc": { "name": "out" },
            "registry": { "destination": "quay.io/a/b:c", "pullSecretName": "s" }
        }))
        .unwrap();

        let err = output.destination().unwrap_err();
        assert_eq!(
            err,
            SpecError::ConflictingVariants {
                field: "output",
                set: vec!["pvc", "registry"],
            }
        );
    }

    #[test]
    fn test_output_destination_requires_a_variant() {
        let output: OutputSpec = serde_json::from_value(json!({ "imageName": "x" })).unwrap();
        assert!(matches!(
            output.destination(),
            Err(SpecError::MissingVariant { field: "output", .. })
        ));
    }

    #[test]
    fn test_empty_provisioner_block_means_none() {
        assert_eq!(ProvisionerSpec::default().variant().unwrap(), None);
    }

    #[test]
    fn test_publish_rejects_both_targets() {
        let publish: PublishSpec = serde_json::from_value(json!({
            "aws": {
                "region": "us-east-1",
                "amiName": "img",
                "instanceType": "t3.small",
                "sourceS3Bucket": "staging",
                "credentialsSecretName": "aws"
            },
            "maas": { "apiUrl": "http://maas/MAAS", "imageName": "img", "credentialsSecretName": "maas" }
        }))
        .unwrap();
        assert!(matches!(
            publish.target(),
            Err(SpecError::ConflictingVariants { field: "publish", .. })
        ));
    }

    #[test]
    fn test_requested_formats_deduplicates_in_order() {
        let mut output = pvc_output();
        output.formats = vec![OutputFormat::Qcow2, OutputFormat::Tgz, OutputFormat::Qcow2];
        assert_eq!(output.requested_formats(), vec![OutputFormat::Qcow2, OutputFormat::Tgz]);
    }

    #[test]
    fn test_architecture_parse() {
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert!("riscv64".parse::<Architecture>().is_err());
    }
}
