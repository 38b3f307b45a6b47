//! Single-consumer scan worker. Serializes scan phases per digest and
//! across digests (one worker, one queue): SBOM acquisition, then
//! vulnerability matching. Early-exit policy reads the live `ImageRecord`
//! status rather than trusting the job's `force` flag alone, which is what
//! gives single-flight-per-digest its teeth (property P2) — a duplicate
//! job for an already-complete, non-forced digest is a silent no-op here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Digest, ImageStatus, PackageRow, ScanJob, VulnerabilityRow};
use crate::error::{Error, Result};
use crate::queue::ScanQueue;
use crate::sbom::{parse_sbom, SbomRetriever, WORKER_SBOM_DEADLINE};
use crate::store::PersistentStore;
use crate::vulndb::VulnDbManager;

/// Matches a parsed SBOM's packages against the on-disk vulnerability
/// database, opaque per scope (Grype's actual matching algorithm is not
/// reimplemented here).
#[async_trait]
pub trait VulnerabilityMatcher: Send + Sync {
    async fn match_vulnerabilities(
        &self,
        packages: &[PackageRow],
        db_dir: &Path,
    ) -> Result<(Vec<u8>, Vec<VulnerabilityRow>)>;
}

pub const WORKER_VULN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Stand-in matcher: the actual Grype matching algorithm is an opaque
/// external collaborator per scope, so this just records that every
/// package was checked and found nothing, proving the seam without
/// reimplementing a vulnerability-matching engine.
pub struct NullVulnerabilityMatcher;

#[async_trait]
impl VulnerabilityMatcher for NullVulnerabilityMatcher {
    async fn match_vulnerabilities(
        &self,
        _packages: &[PackageRow],
        _db_dir: &Path,
    ) -> Result<(Vec<u8>, Vec<VulnerabilityRow>)> {
        Ok((b"[]".to_vec(), Vec::new()))
    }
}

pub struct Worker {
    queue: Arc<ScanQueue>,
    store: Arc<dyn PersistentStore>,
    sbom_retriever: Arc<dyn SbomRetriever>,
    matcher: Arc<dyn VulnerabilityMatcher>,
    vulndb: Arc<VulnDbManager>,
}

impl Worker {
    pub fn new(
        queue: Arc<ScanQueue>,
        store: Arc<dyn PersistentStore>,
        sbom_retriever: Arc<dyn SbomRetriever>,
        matcher: Arc<dyn VulnerabilityMatcher>,
        vulndb: Arc<VulnDbManager>,
    ) -> Self {
        Worker {
            queue,
            store,
            sbom_retriever,
            matcher,
            vulndb,
        }
    }

    /// Drain jobs until the queue shuts down or cancellation fires.
    pub async fn run(&self, cancellation: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = cancellation.cancelled() => return,
                job = self.queue.pop() => job,
            };
            let Some(job) = job else { return };
            let digest = job.image.digest.clone();
            if let Err(e) = self.process(job).await {
                warn!(digest = %digest, error = %e, "scan job failed");
            }
            self.queue.mark_processed();
        }
    }

    #[instrument(skip(self, job), fields(digest = %job.image.digest, force = job.force))]
    async fn process(&self, job: ScanJob) -> Result<()> {
        let digest = job.image.digest.clone();
        let record = self
            .store
            .get_image_record(&digest)
            .await?
            .ok_or_else(|| Error::Invariant(format!("no image record for digest {digest} at scan time")))?;

        if !job.force && record.has_vulnerabilities() {
            debug!("record already complete and not forced, nothing to do");
            return Ok(());
        }

        // Reuse the cached SBOM whenever one is known good; only a forced
        // rescan against a record with no usable SBOM (pending, or a prior
        // SBOM-stage failure) restarts from the SBOM step.
        if !record.has_sbom() {
            self.run_sbom_step(&job, &digest).await?;
        }

        self.run_vuln_step(&job, &digest).await
    }

    async fn run_sbom_step(&self, job: &ScanJob, digest: &Digest) -> Result<()> {
        self.store.set_status(digest, ImageStatus::GeneratingSbom).await?;

        let retrieval = tokio::time::timeout(
            WORKER_SBOM_DEADLINE,
            self.sbom_retriever.retrieve(&job.image, &job.node_hint, job.runtime_hint),
        )
        .await;

        let bytes = match retrieval {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                self.fail_sbom(digest, e.to_string()).await?;
                return Err(e);
            }
            Err(_) => {
                let message = "SBOM retrieval exceeded 5-minute deadline".to_string();
                self.fail_sbom(digest, message.clone()).await?;
                return Err(Error::ScanStage {
                    digest: digest.clone(),
                    message,
                });
            }
        };

        let parsed = match parse_sbom(&bytes) {
            Ok(p) => p,
            Err(e) => {
                self.fail_sbom(digest, e.to_string()).await?;
                return Err(e);
            }
        };

        let packages: Vec<PackageRow> = parsed
            .packages
            .into_iter()
            .map(|p| PackageRow {
                digest: digest.clone(),
                name: p.name,
                version: p.version,
                package_type: p.package_type,
                purl: p.purl,
            })
            .collect();

        self.store
            .store_sbom(digest, bytes, packages, parsed.os_name, parsed.os_version)
            .await?;
        info!(digest = %digest, "SBOM acquired");
        Ok(())
    }

    async fn fail_sbom(&self, digest: &Digest, message: String) -> Result<()> {
        self.store
            .set_status(digest, ImageStatus::SbomFailed { message })
            .await
    }

    async fn run_vuln_step(&self, job: &ScanJob, digest: &Digest) -> Result<()> {
        self.store
            .set_status(digest, ImageStatus::ScanningVulnerabilities)
            .await?;

        let packages = self.store.list_packages(digest).await?;
        let db_state = self.vulndb.current_version();
        let Some(db_state) = db_state else {
            let message = "no vulnerability database loaded yet".to_string();
            self.fail_vuln(digest, message.clone()).await?;
            return Err(Error::ScanStage { digest: digest.clone(), message });
        };

        let matched = tokio::time::timeout(
            WORKER_VULN_DEADLINE,
            self.matcher.match_vulnerabilities(&packages, &db_state.path),
        )
        .await;

        let (findings, rows) = match matched {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.fail_vuln(digest, e.to_string()).await?;
                return Err(e);
            }
            Err(_) => {
                let message = "vulnerability matching exceeded 5-minute deadline".to_string();
                self.fail_vuln(digest, message.clone()).await?;
                return Err(Error::ScanStage {
                    digest: digest.clone(),
                    message,
                });
            }
        };

        let built_at: DateTime<Utc> = db_state.built_at;
        self.store
            .store_vulnerabilities(digest, findings, rows, built_at)
            .await?;
        info!(digest = %digest, job_force = job.force, "vulnerability scan complete");
        Ok(())
    }

    async fn fail_vuln(&self, digest: &Digest, message: String) -> Result<()> {
        self.store
            .set_status(digest, ImageStatus::VulnScanFailed { message })
            .await
    }
}
