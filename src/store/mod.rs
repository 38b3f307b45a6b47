//! Durable storage for observed containers, the distinct-image set and its
//! scan status, cached SBOMs, parsed package lists, vulnerability findings,
//! and the metric-staleness blob. Modeled as a narrow capability trait
//! (`PersistentStore`) so the registry, worker and scheduler depend on an
//! interface rather than a concrete backend — the same seam the teacher
//! draws between `CVEStore`/`ExploitStore`/`RemediationStore` and their
//! backends.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Container, ContainerId, Digest, ImageRecord, PackageRow, VulnerabilityRow};
use crate::error::Result;

/// Result of the orphan-cleanup job: how many image records (and their
/// cascaded rows) were removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub images_deleted: u64,
    pub packages_deleted: u64,
    pub vulnerabilities_deleted: u64,
}

#[async_trait]
pub trait PersistentStore: Send + Sync {
    // -- Containers --------------------------------------------------
    async fn upsert_container(&self, container: &Container) -> Result<()>;
    async fn remove_container(&self, id: &ContainerId) -> Result<()>;
    async fn list_containers(&self) -> Result<Vec<Container>>;
    /// Number of containers currently referencing a digest.
    async fn count_containers_for_digest(&self, digest: &Digest) -> Result<u64>;

    // -- Image records -------------------------------------------------
    /// Insert a new `pending` record if none exists for this digest;
    /// returns `true` if a record was newly created (invariant I1).
    async fn ensure_image_record(&self, digest: &Digest, reference: &str) -> Result<bool>;
    async fn get_image_record(&self, digest: &Digest) -> Result<Option<ImageRecord>>;
    async fn list_image_records(&self) -> Result<Vec<ImageRecord>>;
    async fn list_image_records_built_before(
        &self,
        built_at: DateTime<Utc>,
    ) -> Result<Vec<ImageRecord>>;
    async fn set_status(&self, digest: &Digest, status: crate::domain::ImageStatus) -> Result<()>;
    /// Store SBOM bytes and the packages parsed from them atomically,
    /// advancing status to `scanning_vulnerabilities`.
    async fn store_sbom(
        &self,
        digest: &Digest,
        sbom: Vec<u8>,
        packages: Vec<PackageRow>,
        os_name: Option<String>,
        os_version: Option<String>,
    ) -> Result<()>;
    /// Store vulnerability rows and the DB build timestamp they were
    /// produced against atomically, advancing status to `completed`.
    async fn store_vulnerabilities(
        &self,
        digest: &Digest,
        findings: Vec<u8>,
        rows: Vec<VulnerabilityRow>,
        grype_built_at: DateTime<Utc>,
    ) -> Result<()>;
    /// Delete every image record with zero referencing containers,
    /// cascading to its packages and vulnerabilities (invariant I2).
    async fn cleanup_orphaned_images(&self) -> Result<CleanupStats>;

    // -- Derived rows ----------------------------------------------------
    async fn list_packages(&self, digest: &Digest) -> Result<Vec<PackageRow>>;
    async fn list_vulnerabilities(&self, digest: &Digest) -> Result<Vec<VulnerabilityRow>>;

    // -- Key/value: vulnerability-DB timestamp + metric staleness blob --
    async fn get_vulndb_built_at(&self) -> Result<Option<DateTime<Utc>>>;
    async fn set_vulndb_built_at(&self, built_at: DateTime<Utc>) -> Result<()>;
    async fn get_staleness_blob(&self) -> Result<Option<Vec<u8>>>;
    async fn set_staleness_blob(&self, blob: Vec<u8>) -> Result<()>;
}
