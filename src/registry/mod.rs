//! Authoritative live set of currently-running containers, keyed by
//! `ContainerId`. Every write is mirrored to the `PersistentStore` and may
//! enqueue a scan job. A single readers-writer lock guards the in-memory
//! map; because store writes must be observed by readers atomically with
//! the in-memory mutation, this uses `tokio::sync::RwLock` (not
//! `parking_lot`) so the write guard can be held across the store's async
//! calls without risking a blocking-lock-across-await hazard.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::domain::{Container, ContainerId, Digest, Runtime, ScanJob};
use crate::error::Result;
use crate::queue::ScanQueueHandle;
use crate::store::PersistentStore;

pub struct ContainerRegistry {
    containers: RwLock<HashMap<ContainerId, Container>>,
    store: Arc<dyn PersistentStore>,
    queue: Arc<dyn ScanQueueHandle>,
}

impl ContainerRegistry {
    pub fn new(store: Arc<dyn PersistentStore>, queue: Arc<dyn ScanQueueHandle>) -> Self {
        ContainerRegistry {
            containers: RwLock::new(HashMap::new()),
            store,
            queue,
        }
    }

    /// Seed the in-memory map from the store at startup, before the first
    /// watcher event arrives.
    pub async fn hydrate(&self) -> Result<()> {
        let containers = self.store.list_containers().await?;
        let mut guard = self.containers.write().await;
        for container in containers {
            guard.insert(container.id.clone(), container);
        }
        Ok(())
    }

    #[instrument(skip(self, container), fields(namespace = %container.id.namespace, pod = %container.id.pod, container = %container.id.container_name))]
    pub async fn add(&self, container: Container) -> Result<()> {
        let mut guard = self.containers.write().await;
        self.upsert_locked(&mut guard, &container).await?;
        self.maybe_enqueue_locked(&container).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, id: &ContainerId) -> Result<()> {
        let mut guard = self.containers.write().await;
        guard.remove(id);
        self.store.remove_container(id).await?;
        Ok(())
    }

    /// Replace the in-memory set atomically with the deduplicated set,
    /// diffing against the previous state to issue adds/removes, then
    /// issuing at most one scan enqueue per unique digest in the new set.
    #[instrument(skip(self, containers), fields(count = containers.len()))]
    pub async fn set(&self, containers: Vec<Container>) -> Result<()> {
        let mut deduped: HashMap<ContainerId, Container> = HashMap::new();
        for container in containers {
            deduped.insert(container.id.clone(), container);
        }

        let mut guard = self.containers.write().await;
        let old_ids: HashSet<ContainerId> = guard.keys().cloned().collect();
        let new_ids: HashSet<ContainerId> = deduped.keys().cloned().collect();

        for id in old_ids.difference(&new_ids) {
            guard.remove(id);
            self.store.remove_container(id).await?;
        }

        for container in deduped.values() {
            self.upsert_locked(&mut guard, container).await?;
        }

        // One representative container per unique digest, in first-seen
        // order, for the enqueue pass below.
        let mut representative: HashMap<String, &Container> = HashMap::new();
        for container in deduped.values() {
            representative
                .entry(container.image.digest.key())
                .or_insert(container);
        }

        for container in representative.values() {
            self.maybe_enqueue_locked(container).await?;
        }

        *guard = deduped;
        Ok(())
    }

    async fn upsert_locked(
        &self,
        guard: &mut HashMap<ContainerId, Container>,
        container: &Container,
    ) -> Result<()> {
        guard.insert(container.id.clone(), container.clone());
        self.store.upsert_container(container).await
    }

    /// Upsert the `ImageRecord` for this container's digest and enqueue a
    /// scan if it is new, previously failed, or has incomplete data.
    async fn maybe_enqueue_locked(&self, container: &Container) -> Result<()> {
        let digest = container.image.digest.clone();
        let is_new = self
            .store
            .ensure_image_record(&digest, &container.image.reference)
            .await?;

        let force = if is_new {
            false
        } else {
            match self.store.get_image_record(&digest).await? {
                Some(record) if record.status.is_failed() => true,
                Some(record) if record.data_incomplete() => false,
                Some(_) => return Ok(()), // complete and healthy, nothing to do
                None => false,            // shouldn't happen; ensure_image_record just ran
            }
        };

        debug!(digest = %digest, force, "enqueuing scan");
        let job = ScanJob::new(container.image.clone(), &container.node_name, container.runtime);
        let job = if force { job.forced() } else { job };
        if let Err(e) = self.queue.enqueue(job) {
            warn!(digest = %digest, error = %e, "failed to enqueue scan job");
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<Container> {
        self.containers.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &ContainerId) -> Option<Container> {
        self.containers.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.containers.read().await.len()
    }

    pub async fn unique_digests(&self) -> Vec<Digest> {
        let guard = self.containers.read().await;
        let mut seen = HashSet::new();
        let mut digests = Vec::new();
        for container in guard.values() {
            if seen.insert(container.image.digest.key()) {
                digests.push(container.image.digest.clone());
            }
        }
        digests
    }

    /// Any one currently-live container observed with this digest, for
    /// resolving a node/runtime hint when force-enqueuing a rescan.
    pub async fn representative_for_digest(&self, digest: &Digest) -> Option<Container> {
        self.containers
            .read()
            .await
            .values()
            .find(|c| c.image.digest.key() == digest.key())
            .cloned()
    }
}

/// Parses the Kubernetes `containerID` / `imageID` pair into a `Runtime` and
/// digest, matching the watcher's extraction rules. Lives here because both
/// the registry's tests and the watcher need it, and it operates purely on
/// the domain types this module owns.
pub fn runtime_from_container_id(container_id: &str) -> Runtime {
    Runtime::from_container_id_prefix(container_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ImageRef;
    use crate::queue::{FullBehavior, ScanQueue};
    use crate::store::MemoryStore;

    fn digest(seed: char) -> Digest {
        Digest::parse(&format!("sha256:{}", seed.to_string().repeat(64))).unwrap()
    }

    fn make_container(ns: &str, pod: &str, name: &str, digest: Digest) -> Container {
        Container::new(
            ContainerId::new(ns, pod, name),
            ImageRef {
                reference: format!("{name}:latest"),
                digest,
            },
            "node-a".into(),
            Runtime::Containerd,
        )
    }

    async fn test_registry() -> (ContainerRegistry, Arc<ScanQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(ScanQueue::new(0, FullBehavior::Drop));
        let registry = ContainerRegistry::new(store, queue.clone());
        (registry, queue)
    }

    #[tokio::test]
    async fn add_enqueues_new_digest_once() {
        let (registry, queue) = test_registry().await;
        let d = digest('a');
        registry
            .add(make_container("default", "pod-1", "nginx", d.clone()))
            .await
            .unwrap();
        registry
            .add(make_container("default", "pod-2", "nginx", d.clone()))
            .await
            .unwrap();
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.unique_digests().await.len(), 1);
        // No worker runs here, so the first add()'s ImageRecord stays
        // `Pending` — neither failed nor data-incomplete — and the second
        // add() takes the "complete and healthy, nothing to do" early exit
        // in maybe_enqueue_locked. Only one enqueue happens.
        assert_eq!(queue.metrics().total_enqueued(), 1);
    }

    #[tokio::test]
    async fn set_enqueues_once_per_unique_digest() {
        let (registry, queue) = test_registry().await;
        let d = digest('b');
        let containers = vec![
            make_container("default", "pod-1", "nginx", d.clone()),
            make_container("default", "pod-2", "nginx", d.clone()),
        ];
        registry.set(containers).await.unwrap();
        assert_eq!(registry.len().await, 2);
        assert_eq!(queue.metrics().total_enqueued(), 1);
    }

    #[tokio::test]
    async fn remove_drops_container_but_keeps_image_record() {
        let (registry, _queue) = test_registry().await;
        let d = digest('c');
        let container = make_container("default", "pod-1", "nginx", d.clone());
        registry.add(container.clone()).await.unwrap();
        registry.remove(&container.id).await.unwrap();
        assert_eq!(registry.len().await, 0);
    }
}
