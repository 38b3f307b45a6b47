//! End-to-end scenario tests assembled from the public surface only: a
//! `MemoryStore`, a real `ContainerRegistry`/`ScanQueue`/`Worker`, and fake
//! `SbomRetriever`/`VulnerabilityMatcher`/vulnerability-DB collaborators.
//! Each test walks one of the seed scenarios end to end, driving the
//! worker as a real background task rather than reaching into its
//! private processing method.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use vulnwatch::domain::{
    Container, ContainerId, Digest, ImageRecord, ImageRef, ImageStatus, PackageRow, Runtime,
    VulnerabilityRow,
};
use vulnwatch::queue::{FullBehavior, ScanQueue, ScanQueueHandle};
use vulnwatch::registry::ContainerRegistry;
use vulnwatch::sbom::SbomRetriever;
use vulnwatch::scheduler::{CleanupOrphanedImagesJob, Job, RescanDatabaseJob};
use vulnwatch::store::{MemoryStore, PersistentStore};
use vulnwatch::vulndb::{
    AtomicReadiness, DatabaseLoader, DbDescriptor, DescriptionReader, DistributionClient,
    VulnDbManager,
};
use vulnwatch::worker::{NullVulnerabilityMatcher, VulnerabilityMatcher, Worker};

fn digest(seed: &str) -> Digest {
    let hex: String = seed.chars().cycle().take(64).collect();
    Digest::parse(&format!("sha256:{hex}")).unwrap()
}

fn container(ns: &str, pod: &str, name: &str, reference: &str, digest: Digest) -> Container {
    Container::new(
        ContainerId::new(ns, pod, name),
        ImageRef {
            reference: reference.into(),
            digest,
        },
        "node-a".into(),
        Runtime::Containerd,
    )
}

/// Counts invocations so single-flight (P2) and cache-reuse (P3) can be
/// asserted directly rather than inferred from status alone.
struct CountingRetriever {
    calls: AtomicUsize,
    sbom: Vec<u8>,
}

impl CountingRetriever {
    fn new(sbom: impl Into<Vec<u8>>) -> Self {
        CountingRetriever {
            calls: AtomicUsize::new(0),
            sbom: sbom.into(),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SbomRetriever for CountingRetriever {
    async fn retrieve(&self, _image: &ImageRef, _node_name: &str, _runtime: Runtime) -> vulnwatch::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sbom.clone())
    }
}

struct CountingMatcher {
    calls: AtomicUsize,
}

impl CountingMatcher {
    fn new() -> Self {
        CountingMatcher {
            calls: AtomicUsize::new(0),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VulnerabilityMatcher for CountingMatcher {
    async fn match_vulnerabilities(
        &self,
        packages: &[PackageRow],
        _db_dir: &Path,
    ) -> vulnwatch::Result<(Vec<u8>, Vec<VulnerabilityRow>)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rows = packages
            .iter()
            .map(|p| VulnerabilityRow {
                digest: p.digest.clone(),
                cve_id: "CVE-2024-0001".into(),
                severity: "high".into(),
                fix_status: "fixed".into(),
                fixed_version: Some("2.32".into()),
                package_name: p.name.clone(),
                package_version: p.version.clone(),
                known_exploited: false,
                risk_score: 7.5,
                count: 1,
            })
            .collect();
        Ok((b"findings".to_vec(), rows))
    }
}

struct FixedFeed;
#[async_trait]
impl DistributionClient for FixedFeed {
    async fn check_for_update(&self, _current: Option<DateTime<Utc>>) -> vulnwatch::Result<Option<DbDescriptor>> {
        Ok(None)
    }
}

struct NoopLoader;
#[async_trait]
impl DatabaseLoader for NoopLoader {
    async fn install(&self, _descriptor: &DbDescriptor, _db_dir: &Path) -> vulnwatch::Result<()> {
        Ok(())
    }
}

/// A `DescriptionReader` whose answer the test can move forward in time,
/// to simulate the on-disk description file changing out from under the
/// manager between scheduler ticks.
struct MutableDescriptionReader(Mutex<DateTime<Utc>>);

impl MutableDescriptionReader {
    fn advance_to(&self, built_at: DateTime<Utc>) {
        *self.0.lock().unwrap() = built_at;
    }
}

#[async_trait]
impl DescriptionReader for MutableDescriptionReader {
    async fn read_built_at(&self, _db_dir: &Path) -> vulnwatch::Result<Option<(DateTime<Utc>, String)>> {
        Ok(Some((*self.0.lock().unwrap(), "6".into())))
    }
}

/// Assembles the full pipeline (registry + queue + worker) with fake
/// terminal collaborators, wired the same way `Controller::run` wires the
/// real ones, with the worker driven as a genuine background task.
struct Harness {
    store: Arc<MemoryStore>,
    registry: Arc<ContainerRegistry>,
    queue: Arc<ScanQueue>,
    retriever: Arc<CountingRetriever>,
    matcher: Arc<CountingMatcher>,
    vulndb: Arc<VulnDbManager>,
    description_reader: Arc<MutableDescriptionReader>,
    cancellation: CancellationToken,
    worker_handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    /// Cancel the worker task and wait for the queue to finish draining
    /// whatever was already in flight.
    async fn shutdown(self) {
        self.queue.shutdown();
        self.cancellation.cancel();
        let _ = self.worker_handle.await;
    }
}

async fn harness(sbom_body: &'static [u8], db_built_at: DateTime<Utc>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(ScanQueue::new(0, FullBehavior::Drop));
    let registry = Arc::new(ContainerRegistry::new(store.clone(), queue.clone()));

    let dir = tempdir().unwrap();
    let description_reader = Arc::new(MutableDescriptionReader(Mutex::new(db_built_at)));
    let vulndb = Arc::new(VulnDbManager::new(
        dir.path().to_path_buf(),
        description_reader.clone() as Arc<dyn DescriptionReader>,
        Arc::new(FixedFeed),
        Arc::new(NoopLoader),
        Arc::new(AtomicReadiness::new()),
        store.clone(),
        std::time::Duration::from_millis(10),
    ));
    vulndb.check_for_updates().await.unwrap();

    let retriever = Arc::new(CountingRetriever::new(sbom_body));
    let matcher = Arc::new(CountingMatcher::new());
    let worker = Arc::new(Worker::new(
        queue.clone(),
        store.clone() as Arc<dyn PersistentStore>,
        retriever.clone(),
        matcher.clone(),
        vulndb.clone(),
    ));

    let cancellation = CancellationToken::new();
    let worker_handle = {
        let worker = worker.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move { worker.run(cancellation).await })
    };

    Harness {
        store,
        registry,
        queue,
        retriever,
        matcher,
        vulndb,
        description_reader,
        cancellation,
        worker_handle,
    }
}

/// Polls the store until `predicate` holds for the record, or panics after
/// a generous timeout. Every scenario here is expected to settle in a few
/// worker ticks, never in real wall-clock minutes.
async fn wait_for(store: &MemoryStore, digest: &Digest, predicate: impl Fn(&ImageRecord) -> bool) -> ImageRecord {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(record) = store.get_image_record(digest).await.unwrap() {
                if predicate(&record) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("record did not reach the expected state in time")
}

const SBOM_ONE_PACKAGE: &[u8] =
    br#"{"packages":[{"name":"libc","version":"2.31","type":"deb"}],"os_name":"debian"}"#;

#[tokio::test]
async fn happy_path_single_container_completes() {
    let h = harness(SBOM_ONE_PACKAGE, Utc::now()).await;
    let d = digest("a");
    h.registry
        .add(container("default", "web-1", "nginx", "nginx:1.21", d.clone()))
        .await
        .unwrap();

    let record = wait_for(&h.store, &d, |r| matches!(r.status, ImageStatus::Completed)).await;
    assert_eq!(record.os_name.as_deref(), Some("debian"));
    assert_eq!(h.retriever.call_count(), 1);
    assert_eq!(h.matcher.call_count(), 1);
    assert_eq!(h.store.list_packages(&d).await.unwrap().len(), 1);
    assert_eq!(h.store.list_vulnerabilities(&d).await.unwrap().len(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_across_pods_single_sbom_retrieval() {
    let h = harness(SBOM_ONE_PACKAGE, Utc::now()).await;
    let d = digest("b");
    h.registry
        .add(container("default", "pod-1", "nginx", "nginx:1.21", d.clone()))
        .await
        .unwrap();
    h.registry
        .add(container("default", "pod-2", "nginx", "nginx:1.21", d.clone()))
        .await
        .unwrap();

    wait_for(&h.store, &d, |r| matches!(r.status, ImageStatus::Completed)).await;

    assert_eq!(h.registry.len().await, 2);
    assert_eq!(h.registry.unique_digests().await.len(), 1);
    assert_eq!(h.retriever.call_count(), 1, "single-flight per digest (P2)");

    h.shutdown().await;
}

#[tokio::test]
async fn registry_port_reference_preserved_byte_identical() {
    let h = harness(SBOM_ONE_PACKAGE, Utc::now()).await;
    let d = digest("c");
    let reference = "localhost:5000/myimage:latest";
    h.registry
        .add(container("default", "pod-1", "myimage", reference, d.clone()))
        .await
        .unwrap();

    let record = h.store.get_image_record(&d).await.unwrap().unwrap();
    assert_eq!(record.reference, reference, "port must not be parsed as a tag");

    h.shutdown().await;
}

#[tokio::test]
async fn force_rescan_from_sbom_failed_retries_sbom() {
    let h = harness(SBOM_ONE_PACKAGE, Utc::now()).await;
    let d = digest("d");

    h.store.ensure_image_record(&d, "nginx:1.21").await.unwrap();
    h.store
        .set_status(&d, ImageStatus::SbomFailed { message: "sidecar unreachable".into() })
        .await
        .unwrap();

    // Re-observing the same container is what the registry's maybe_enqueue
    // policy turns into a forced job once the record is in a failed state.
    h.registry
        .add(container("default", "pod-1", "nginx", "nginx:1.21", d.clone()))
        .await
        .unwrap();

    wait_for(&h.store, &d, |r| matches!(r.status, ImageStatus::Completed)).await;
    assert_eq!(h.retriever.call_count(), 1, "SBOM step must retry after a prior SBOM failure");

    h.shutdown().await;
}

#[tokio::test]
async fn db_update_triggers_rescans_with_cached_sbom_reuse() {
    let t0 = Utc::now() - chrono::Duration::hours(2);
    let h = harness(SBOM_ONE_PACKAGE, t0).await;

    let d1 = digest("e");
    let d2 = digest("f");
    h.registry
        .add(container("default", "pod-1", "nginx", "nginx:1.21", d1.clone()))
        .await
        .unwrap();
    h.registry
        .add(container("default", "pod-2", "redis", "redis:7", d2.clone()))
        .await
        .unwrap();
    wait_for(&h.store, &d1, |r| matches!(r.status, ImageStatus::Completed)).await;
    wait_for(&h.store, &d2, |r| matches!(r.status, ImageStatus::Completed)).await;

    assert_eq!(h.retriever.call_count(), 2);
    assert_eq!(h.matcher.call_count(), 2);
    for d in [&d1, &d2] {
        let record = h.store.get_image_record(d).await.unwrap().unwrap();
        assert_eq!(record.grype_db_built_at, Some(t0));
    }

    // Advance the on-disk description's built-at past T0 and run the
    // rescan-database job exactly as the scheduler would.
    let t1 = Utc::now();
    h.description_reader.advance_to(t1);

    let job = RescanDatabaseJob::new(
        h.vulndb.clone(),
        h.store.clone() as Arc<dyn PersistentStore>,
        h.registry.clone(),
        h.queue.clone() as Arc<dyn ScanQueueHandle>,
    );
    job.run().await.unwrap();

    wait_for(&h.store, &d1, |r| r.grype_db_built_at == Some(t1)).await;
    wait_for(&h.store, &d2, |r| r.grype_db_built_at == Some(t1)).await;

    assert_eq!(h.retriever.call_count(), 2, "cached SBOM must be reused, not re-fetched (P3)");
    assert_eq!(h.matcher.call_count(), 4, "both stale records must be re-matched");

    h.shutdown().await;
}

#[tokio::test]
async fn orphan_cleanup_cascades_and_reports_counts() {
    let h = harness(SBOM_ONE_PACKAGE, Utc::now()).await;
    let d = digest("g");
    let c = container("default", "pod-1", "nginx", "nginx:1.21", d.clone());
    h.registry.add(c.clone()).await.unwrap();
    wait_for(&h.store, &d, |r| matches!(r.status, ImageStatus::Completed)).await;

    h.registry.remove(&c.id).await.unwrap();

    let job = CleanupOrphanedImagesJob::new(h.store.clone() as Arc<dyn PersistentStore>);
    job.run().await.unwrap();

    assert!(h.store.get_image_record(&d).await.unwrap().is_none());
    assert!(h.store.list_packages(&d).await.unwrap().is_empty());
    assert!(h.store.list_vulnerabilities(&d).await.unwrap().is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn cleanup_preserves_images_with_surviving_containers() {
    let h = harness(SBOM_ONE_PACKAGE, Utc::now()).await;
    let d = digest("h");
    h.registry
        .add(container("default", "pod-1", "nginx", "nginx:1.21", d.clone()))
        .await
        .unwrap();
    h.registry
        .add(container("default", "pod-2", "nginx", "nginx:1.21", d.clone()))
        .await
        .unwrap();
    wait_for(&h.store, &d, |r| matches!(r.status, ImageStatus::Completed)).await;

    h.registry
        .remove(&ContainerId::new("default", "pod-1", "nginx"))
        .await
        .unwrap();

    let job = CleanupOrphanedImagesJob::new(h.store.clone() as Arc<dyn PersistentStore>);
    job.run().await.unwrap();

    assert!(h.store.get_image_record(&d).await.unwrap().is_some(), "pod-2 still references this digest");

    h.shutdown().await;
}

#[tokio::test]
async fn null_matcher_is_a_documented_noop_seam() {
    let matcher = NullVulnerabilityMatcher;
    let dir = tempdir().unwrap();
    let (findings, rows) = matcher.match_vulnerabilities(&[], dir.path()).await.unwrap();
    assert_eq!(findings, b"[]".to_vec());
    assert!(rows.is_empty());
}
