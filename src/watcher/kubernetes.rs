use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ContainerSource;
use crate::domain::{Container, ContainerId, Digest, ImageRef, Runtime};
use crate::error::{Error, Result};
use crate::registry::ContainerRegistry;
use crate::scheduler::RefreshTrigger;

/// On startup: one full list of `Running` pods, built into `Container`s and
/// handed to `Registry::set`. Then an indefinite watch loop: channel close
/// backs off 1s before reopening; a failure to open the watch itself backs
/// off 5s.
pub struct KubeWatcher {
    client: kube::Client,
    namespace: Option<String>,
}

impl KubeWatcher {
    pub fn new(client: kube::Client, namespace: Option<String>) -> Self {
        KubeWatcher { client, namespace }
    }

    fn api(&self) -> Api<Pod> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// One full list of `Running` pods, reconciled into the registry via
    /// `Registry::set`. Used both for the initial sync on startup and as
    /// the `refresh-images` job's `RefreshTrigger`.
    pub async fn full_resync(&self, registry: &ContainerRegistry) -> Result<()> {
        let pods = self
            .api()
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Transient(format!("initial pod list failed: {e}")))?;

        let mut containers = Vec::new();
        for pod in &pods.items {
            if !is_running(pod) {
                continue;
            }
            containers.extend(extract_containers(pod));
        }
        info!(count = containers.len(), "initial container list");
        registry.set(containers).await
    }

    /// One watch attempt. Distinguishes "failed to even open the watch" from
    /// "the opened stream later closed/errored" so the caller can apply the
    /// two different backoff tiers the initial-open and mid-stream failure
    /// cases call for.
    async fn watch_once(&self, registry: &ContainerRegistry, cancellation: &CancellationToken) -> WatchOutcome {
        let wp = WatchParams::default();
        let mut stream = match self.api().watch(&wp, "0").await {
            Ok(s) => Box::pin(s),
            Err(e) => return WatchOutcome::OpenFailed(Error::Transient(format!("failed to open pod watch: {e}"))),
        };

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return WatchOutcome::Cancelled,
                next = stream.try_next() => {
                    match next {
                        Ok(Some(event)) => {
                            if let Err(e) = self.handle_event(registry, event).await {
                                return WatchOutcome::StreamError(e);
                            }
                        }
                        Ok(None) => return WatchOutcome::StreamError(Error::Transient("pod watch stream closed".into())),
                        Err(e) => return WatchOutcome::StreamError(Error::Transient(format!("pod watch stream error: {e}"))),
                    }
                }
            }
        }
    }

    async fn handle_event(&self, registry: &ContainerRegistry, event: WatchEvent<Pod>) -> Result<()> {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                if is_running(&pod) {
                    for container in extract_containers(&pod) {
                        registry.add(container).await?;
                    }
                } else {
                    for id in container_ids(&pod) {
                        registry.remove(&id).await?;
                    }
                }
            }
            WatchEvent::Deleted(pod) => {
                for id in container_ids(&pod) {
                    registry.remove(&id).await?;
                }
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(status) => {
                return Err(Error::Transient(format!("pod watch error event: {status:?}")));
            }
        }
        Ok(())
    }
}

/// Result of one `watch_once` attempt. `OpenFailed` and `StreamError` carry
/// distinct backoff tiers (5s / 1s respectively); `Cancelled` means the
/// caller should stop without backing off at all.
enum WatchOutcome {
    OpenFailed(Error),
    StreamError(Error),
    Cancelled,
}

const INITIAL_WATCH_OPEN_BACKOFF: Duration = Duration::from_secs(5);
const STREAM_INTERRUPTED_BACKOFF: Duration = Duration::from_secs(1);

#[async_trait]
impl ContainerSource for KubeWatcher {
    async fn run(&self, registry: Arc<ContainerRegistry>, cancellation: CancellationToken) -> Result<()> {
        self.full_resync(&registry).await?;

        loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }
            let backoff = match self.watch_once(&registry, &cancellation).await {
                WatchOutcome::Cancelled => return Ok(()),
                WatchOutcome::OpenFailed(e) => {
                    warn!(error = %e, "failed to open pod watch, backing off before retrying");
                    INITIAL_WATCH_OPEN_BACKOFF
                }
                WatchOutcome::StreamError(e) => {
                    warn!(error = %e, "pod watch interrupted, backing off before reopening");
                    STREAM_INTERRUPTED_BACKOFF
                }
            };
            tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

#[async_trait]
impl RefreshTrigger for KubeWatcher {
    async fn refresh(&self, registry: &ContainerRegistry) -> Result<()> {
        self.full_resync(registry).await
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
}

/// Every container identity on a pod, regardless of whether a digest is
/// known yet — used for removal, which doesn't need the image.
fn container_ids(pod: &Pod) -> Vec<ContainerId> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| ContainerId::new(namespace.clone(), pod_name.clone(), cs.name.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn extract_containers(pod: &Pod) -> Vec<Container> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();

    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for cs in statuses {
        let Some(container_id_raw) = cs.container_id.as_deref() else {
            continue;
        };
        let Some(digest) = parse_image_id(&cs.image_id) else {
            debug!(pod = %pod_name, container = %cs.name, "no digest yet, dropping observation");
            continue;
        };
        let runtime = Runtime::from_container_id_prefix(container_id_raw);
        let id = ContainerId::new(namespace.clone(), pod_name.clone(), cs.name.clone());
        let image = ImageRef {
            reference: cs.image.clone(),
            digest,
        };
        out.push(Container::new(id, image, node_name.clone(), runtime));
    }
    out
}

/// Digest extraction from `imageID`: substring after the first `@`; if
/// none, accept a bare `sha256:...` value; otherwise no digest yet.
fn parse_image_id(raw: &str) -> Option<Digest> {
    if let Some((_, after)) = raw.split_once('@') {
        return Digest::parse(after).ok();
    }
    if raw.starts_with("sha256:") {
        return Digest::parse(raw).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_after_at_sign() {
        let d = parse_image_id("docker.io/library/nginx@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(d.is_some());
    }

    #[test]
    fn accepts_bare_sha256_without_at_sign() {
        let raw = format!("sha256:{}", "b".repeat(64));
        assert!(parse_image_id(&raw).is_some());
    }

    #[test]
    fn no_digest_yet_returns_none() {
        assert!(parse_image_id("nginx:latest").is_none());
    }
}
