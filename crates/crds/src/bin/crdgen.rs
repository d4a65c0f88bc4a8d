//! Prints the ImageBuild CustomResourceDefinition as YAML.
//!
//! `cargo run -p crds --bin crdgen > config/crd/imagebuild.yaml`

use anyhow::Context;
use crds::ImageBuild;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crd = ImageBuild::crd();
    let yaml = serde_yaml::to_string(&crd).context("failed to serialize ImageBuild CRD")?;
    print!("{yaml}");
    Ok(())
}
