//! Assembles every component and drives the process lifecycle: hydrate the
//! registry, start the watcher/worker/scheduler/API tasks, and coordinate
//! shutdown from a single `CancellationToken`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::queue::ScanQueue;
use crate::registry::ContainerRegistry;
use crate::sbom::{HttpSbomRetriever, NodeAddressResolver, StaticAddressBook};
use crate::scheduler::{
    CleanupOrphanedImagesJob, JobSchedule, RefreshTrigger, RescanDatabaseJob, Scheduler,
};
use crate::store::{PersistentStore, SqliteStore};
use crate::vulndb::{AtomicReadiness, FileDescriptionReader, HttpDatabaseLoader, HttpDistributionClient, VulnDbManager};
use crate::watcher::{ContainerSource, KubeWatcher};
use crate::worker::{NullVulnerabilityMatcher, Worker};

pub struct Controller {
    config: Config,
    cancellation: CancellationToken,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        Controller {
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Build every component and run until `cancellation` fires. Returns
    /// once all tasks have observed cancellation and exited.
    pub async fn run(self) -> crate::error::Result<()> {
        let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::connect(&self.config.store_path).await?);

        let queue = Arc::new(ScanQueue::new(self.config.queue.max_depth, self.config.queue.full_behavior));

        let registry = Arc::new(ContainerRegistry::new(store.clone(), queue.clone()));
        registry.hydrate().await?;

        let readiness = Arc::new(AtomicReadiness::new());
        let vulndb = Arc::new(VulnDbManager::new(
            self.config.vulndb_dir.clone(),
            Arc::new(FileDescriptionReader),
            Arc::new(HttpDistributionClient::new(self.config.vulndb.feed_url.clone())?),
            Arc::new(HttpDatabaseLoader::new()?),
            readiness.clone(),
            store.clone(),
            self.config.vulndb.feed_poll_interval,
        ));
        if let Err(e) = vulndb.check_for_updates().await {
            warn!(error = %e, "initial vulnerability-DB check failed, continuing without one");
        }

        let staleness = Arc::new(
            crate::metrics::MetricStalenessTracker::load(store.clone(), self.config.api.metric_staleness_window)
                .await?,
        );

        let address_book = Arc::new(StaticAddressBook::new());
        let sbom_retriever = Arc::new(HttpSbomRetriever::new(
            address_book.clone() as Arc<dyn NodeAddressResolver>,
            8080,
        )?);

        let worker = Worker::new(
            queue.clone(),
            store.clone(),
            sbom_retriever,
            Arc::new(NullVulnerabilityMatcher),
            vulndb.clone(),
        );

        let kube_watcher = match kube::Client::try_default().await {
            Ok(client) => Arc::new(KubeWatcher::new(client, self.config.namespace.clone())),
            Err(e) => {
                error!(error = %e, "failed to build Kubernetes client, watcher will not run");
                return Err(crate::error::Error::Fatal(format!("kube client init failed: {e}")));
            }
        };

        let scheduler = Arc::new(Scheduler::new());
        scheduler.add_job(
            "refresh-images",
            Arc::new(crate::scheduler::RefreshImagesJob::new(
                registry.clone(),
                kube_watcher.clone() as Arc<dyn RefreshTrigger>,
            )),
            job_schedule(&self.config.scheduler.refresh_images),
        )?;
        scheduler.add_job(
            "rescan-database",
            Arc::new(RescanDatabaseJob::new(
                vulndb.clone(),
                store.clone(),
                registry.clone(),
                queue.clone(),
            )),
            job_schedule(&self.config.scheduler.rescan_database),
        )?;
        scheduler.add_job(
            "cleanup-orphaned-images",
            Arc::new(CleanupOrphanedImagesJob::new(store.clone())),
            job_schedule(&self.config.scheduler.cleanup_orphaned_images),
        )?;
        scheduler.start();

        let watcher_handle = {
            let watcher = kube_watcher.clone() as Arc<dyn ContainerSource>;
            let registry = registry.clone();
            let cancellation = self.cancellation.clone();
            tokio::spawn(async move {
                if let Err(e) = watcher.run(registry, cancellation).await {
                    error!(error = %e, "watcher exited with error");
                }
            })
        };

        let worker_handle = {
            let cancellation = self.cancellation.clone();
            tokio::spawn(async move { worker.run(cancellation).await })
        };

        #[cfg(feature = "api")]
        let api_handle = {
            let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
            let api = crate::api::ApiServer::new(addr, readiness, queue.clone(), staleness.clone());
            let cancellation = self.cancellation.clone();
            Some(tokio::spawn(async move { api.run(cancellation).await }))
        };
        #[cfg(not(feature = "api"))]
        let api_handle: Option<tokio::task::JoinHandle<()>> = None;

        info!("vulnwatch controller running");
        self.cancellation.cancelled().await;
        info!("shutdown signal received, draining");

        queue.shutdown();
        scheduler.stop().await;
        let _ = watcher_handle.await;
        let _ = worker_handle.await;
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn job_schedule(job: &crate::config::JobConfig) -> JobSchedule {
    let mut schedule = JobSchedule::every(job.interval)
        .with_jitter(job.jitter)
        .with_timeout(job.timeout);
    if !job.enabled {
        schedule = schedule.disabled();
    }
    schedule
}
