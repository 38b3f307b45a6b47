//! Single-host analogue of `KubeWatcher`: no native watch API, so this
//! polls the local Docker daemon on a fixed interval and reconciles via
//! `Registry::set`, matching the Kubernetes source's full-resync shape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::Docker;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::ContainerSource;
use crate::domain::{Container, ContainerId, Digest, ImageRef, Runtime};
use crate::error::{Error, Result};
use crate::registry::ContainerRegistry;

pub struct DockerWatcher {
    docker: Docker,
    node_name: String,
    poll_interval: Duration,
}

impl DockerWatcher {
    pub fn new(docker: Docker, node_name: impl Into<String>, poll_interval: Duration) -> Self {
        DockerWatcher {
            docker,
            node_name: node_name.into(),
            poll_interval,
        }
    }

    async fn list_once(&self) -> Result<Vec<Container>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::Transient(format!("docker list_containers failed: {e}")))?;

        let mut out = Vec::new();
        for summary in summaries {
            let Some(id) = summary.id.as_deref() else { continue };
            let Some(image_ref) = summary.image.clone() else { continue };
            let Some(digest_raw) = summary.image_id.as_deref() else {
                continue;
            };
            let Some(digest) = parse_image_ref_digest(digest_raw) else {
                continue;
            };
            let names = summary.names.unwrap_or_default();
            let name = names
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.to_string());

            out.push(Container::new(
                ContainerId::new("default", name.clone(), name),
                ImageRef {
                    reference: image_ref,
                    digest,
                },
                self.node_name.clone(),
                Runtime::Docker,
            ));
        }
        Ok(out)
    }
}

fn parse_image_ref_digest(raw: &str) -> Option<Digest> {
    if let Some((_, after)) = raw.split_once('@') {
        return Digest::parse(after).ok();
    }
    Digest::parse(raw).ok()
}

#[async_trait]
impl ContainerSource for DockerWatcher {
    async fn run(&self, registry: Arc<ContainerRegistry>, cancellation: CancellationToken) -> Result<()> {
        loop {
            match self.list_once().await {
                Ok(containers) => {
                    if let Err(e) = registry.set(containers).await {
                        warn!(error = %e, "failed to reconcile registry from docker listing");
                    }
                }
                Err(e) => warn!(error = %e, "docker container listing failed"),
            }

            tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
