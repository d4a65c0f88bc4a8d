//! Cluster Client
//!
//! The narrow set of Kubernetes operations the ImageBuild reconciler needs:
//! reading an ImageBuild and its builder Job, managing the finalizer,
//! creating and deleting the Job, and patching status.
//!
//! The reconciler only talks to the [`ClusterClient`] trait. Production code
//! uses [`KubeClusterClient`]; tests use the in-memory `MockClusterClient`
//! (feature `test-util`), which also records every mutating call so call
//! ordering can be asserted.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClient, KubeClusterClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::new(kube::Client::try_default().await?, "imagebuild-controller");
//! if let Some(ib) = client.get_image_build("default", "ubuntu").await? {
//!     println!("phase: {:?}", ib.status.map(|s| s.phase));
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClient;
pub use error::ClusterError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{ClusterEvent, MockClusterClient, Operation};
