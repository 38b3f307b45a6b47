//! Concrete core jobs: refresh-images, rescan-database, cleanup-orphaned-images.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Job;
use crate::error::Result;
use crate::queue::ScanQueueHandle;
use crate::registry::ContainerRegistry;
use crate::store::PersistentStore;
use crate::vulndb::VulnDbManager;

/// Re-lists the environment and calls `Registry::set`, reconciling any
/// events the watcher missed. The embedding deployment supplies the
/// listing mechanism (Kubernetes full-list, Docker container list, ...).
#[async_trait]
pub trait RefreshTrigger: Send + Sync {
    async fn refresh(&self, registry: &ContainerRegistry) -> Result<()>;
}

pub struct RefreshImagesJob {
    registry: Arc<ContainerRegistry>,
    trigger: Arc<dyn RefreshTrigger>,
}

impl RefreshImagesJob {
    pub fn new(registry: Arc<ContainerRegistry>, trigger: Arc<dyn RefreshTrigger>) -> Self {
        RefreshImagesJob { registry, trigger }
    }
}

#[async_trait]
impl Job for RefreshImagesJob {
    async fn run(&self) -> Result<()> {
        self.trigger.refresh(&self.registry).await
    }
}

/// Checks the vulnerability DB for updates; on change, force-enqueues a
/// rescan for every image record built against an older DB.
pub struct RescanDatabaseJob {
    vulndb: Arc<VulnDbManager>,
    store: Arc<dyn PersistentStore>,
    registry: Arc<ContainerRegistry>,
    queue: Arc<dyn ScanQueueHandle>,
}

impl RescanDatabaseJob {
    pub fn new(
        vulndb: Arc<VulnDbManager>,
        store: Arc<dyn PersistentStore>,
        registry: Arc<ContainerRegistry>,
        queue: Arc<dyn ScanQueueHandle>,
    ) -> Self {
        RescanDatabaseJob {
            vulndb,
            store,
            registry,
            queue,
        }
    }
}

#[async_trait]
impl Job for RescanDatabaseJob {
    async fn run(&self) -> Result<()> {
        let (changed, built_at) = self.vulndb.check_for_updates().await?;
        if !changed {
            return Ok(());
        }

        let stale = self.store.list_image_records_built_before(built_at).await?;
        info!(count = stale.len(), new_built_at = %built_at, "vulnerability DB changed, force-rescanning stale images");

        for record in stale {
            let Some(container) = self.registry.representative_for_digest(&record.digest).await else {
                warn!(digest = %record.digest, "no live container to source node/runtime hint for rescan, skipping");
                continue;
            };
            let job = crate::domain::ScanJob::new(
                crate::domain::ImageRef {
                    reference: container.image.reference.clone(),
                    digest: record.digest.clone(),
                },
                &container.node_name,
                container.runtime,
            )
            .forced();
            if let Err(e) = self.queue.enqueue(job) {
                warn!(digest = %record.digest, error = %e, "failed to enqueue force-rescan");
            }
        }
        Ok(())
    }
}

/// Deletes every image record with zero referencing containers.
pub struct CleanupOrphanedImagesJob {
    store: Arc<dyn PersistentStore>,
}

impl CleanupOrphanedImagesJob {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        CleanupOrphanedImagesJob { store }
    }
}

#[async_trait]
impl Job for CleanupOrphanedImagesJob {
    async fn run(&self) -> Result<()> {
        let stats = self.store.cleanup_orphaned_images().await?;
        info!(
            images_deleted = stats.images_deleted,
            packages_deleted = stats.packages_deleted,
            vulnerabilities_deleted = stats.vulnerabilities_deleted,
            "orphaned-image cleanup complete"
        );
        Ok(())
    }
}
