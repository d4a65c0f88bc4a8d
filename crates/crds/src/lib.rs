//! ImageBuild CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the image build operator,
//! plus the environment/path contract shared between the controller that
//! spawns builder Jobs and the `image-builder` process running inside them.

pub mod conditions;
pub mod contract;
pub mod image_build;
pub mod status;

pub use conditions::*;
pub use image_build::*;
pub use status::*;
