//! Image Builder
//!
//! The process executed by every builder Job. It reads its instructions
//! from environment variables (see [`crds::contract`]) and turns a base
//! container image into filesystem artifacts:
//!
//! 1. create a working container from the base image and mount it
//! 2. bind `/dev` into the root, optionally clone the provisioning source
//!    and run the playbook against the root through a chroot connection,
//!    then release the bind
//! 3. remount the container and archive its root into `/output`
//! 4. unmount and remove the working container
//!
//! Every external tool runs through the [`CommandRunner`] trait so the
//! sequence can be exercised without buildah or ansible installed.

pub mod env;
pub mod error;
pub mod runner;
pub mod sequence;

pub use env::{BuilderEnv, Playbook, SourceRepo};
pub use error::BuilderError;
pub use runner::{CommandRunner, CommandSpec, ProcessRunner};
pub use sequence::{run_build, BuildArtifacts};

#[cfg(test)]
mod sequence_test;
