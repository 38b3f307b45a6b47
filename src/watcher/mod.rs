//! Converts external container observations into `ContainerRegistry`
//! mutations. The Kubernetes source is the primary implementation; a
//! Docker-direct source is available behind the `host-runtime` feature for
//! single-host deployments.

mod kubernetes;

#[cfg(feature = "host-runtime")]
mod docker;

pub use kubernetes::KubeWatcher;

#[cfg(feature = "host-runtime")]
pub use docker::DockerWatcher;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::ContainerRegistry;

/// A source of container observations. `run` should loop until
/// `cancellation` fires, honoring it promptly at suspension points.
#[async_trait]
pub trait ContainerSource: Send + Sync {
    async fn run(&self, registry: Arc<ContainerRegistry>, cancellation: CancellationToken) -> Result<()>;
}
