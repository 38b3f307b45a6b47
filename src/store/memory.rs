//! In-memory `PersistentStore` used by unit/integration tests and as a
//! reference implementation, in the spirit of the teacher's
//! `SimpleLocalStorage` ("storage that works without external
//! dependencies").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{CleanupStats, PersistentStore};
use crate::domain::{
    Container, ContainerId, Digest, ImageRecord, ImageStatus, PackageRow, VulnerabilityRow,
};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    containers: HashMap<ContainerId, Container>,
    images: HashMap<String, ImageRecord>,
    packages: HashMap<String, Vec<PackageRow>>,
    vulnerabilities: HashMap<String, Vec<VulnerabilityRow>>,
    vulndb_built_at: Option<DateTime<Utc>>,
    staleness_blob: Option<Vec<u8>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn upsert_container(&self, container: &Container) -> Result<()> {
        self.inner
            .lock()
            .containers
            .insert(container.id.clone(), container.clone());
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        self.inner.lock().containers.remove(id);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        Ok(self.inner.lock().containers.values().cloned().collect())
    }

    async fn count_containers_for_digest(&self, digest: &Digest) -> Result<u64> {
        let key = digest.key();
        Ok(self
            .inner
            .lock()
            .containers
            .values()
            .filter(|c| c.image.digest.key() == key)
            .count() as u64)
    }

    async fn ensure_image_record(&self, digest: &Digest, reference: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = digest.key();
        if inner.images.contains_key(&key) {
            return Ok(false);
        }
        let image_ref = crate::domain::ImageRef {
            reference: reference.to_string(),
            digest: digest.clone(),
        };
        inner
            .images
            .insert(key, ImageRecord::pending(&image_ref));
        Ok(true)
    }

    async fn get_image_record(&self, digest: &Digest) -> Result<Option<ImageRecord>> {
        Ok(self.inner.lock().images.get(&digest.key()).cloned())
    }

    async fn list_image_records(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.inner.lock().images.values().cloned().collect())
    }

    async fn list_image_records_built_before(
        &self,
        built_at: DateTime<Utc>,
    ) -> Result<Vec<ImageRecord>> {
        Ok(self
            .inner
            .lock()
            .images
            .values()
            .filter(|r| r.grype_db_built_at.map(|t| t < built_at).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn set_status(&self, digest: &Digest, status: ImageStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.images.get_mut(&digest.key()) {
            record.status = status;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn store_sbom(
        &self,
        digest: &Digest,
        sbom: Vec<u8>,
        packages: Vec<PackageRow>,
        os_name: Option<String>,
        os_version: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = digest.key();
        if let Some(record) = inner.images.get_mut(&key) {
            record.sbom = Some(sbom);
            record.sbom_produced_at = Some(Utc::now());
            record.status = ImageStatus::ScanningVulnerabilities;
            record.os_name = os_name;
            record.os_version = os_version;
            record.updated_at = Utc::now();
        }
        inner.packages.insert(key, packages);
        Ok(())
    }

    async fn store_vulnerabilities(
        &self,
        digest: &Digest,
        findings: Vec<u8>,
        rows: Vec<VulnerabilityRow>,
        grype_built_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = digest.key();
        if let Some(record) = inner.images.get_mut(&key) {
            record.vulnerabilities = Some(findings);
            record.vulnerabilities_produced_at = Some(Utc::now());
            record.grype_db_built_at = Some(grype_built_at);
            record.status = ImageStatus::Completed;
            record.updated_at = Utc::now();
        }
        inner.vulnerabilities.insert(key, rows);
        Ok(())
    }

    async fn cleanup_orphaned_images(&self) -> Result<CleanupStats> {
        let mut inner = self.inner.lock();
        let referenced: std::collections::HashSet<String> = inner
            .containers
            .values()
            .map(|c| c.image.digest.key())
            .collect();
        let orphaned: Vec<String> = inner
            .images
            .keys()
            .filter(|k| !referenced.contains(*k))
            .cloned()
            .collect();

        let mut stats = CleanupStats::default();
        for key in orphaned {
            inner.images.remove(&key);
            stats.images_deleted += 1;
            if let Some(pkgs) = inner.packages.remove(&key) {
                stats.packages_deleted += pkgs.len() as u64;
            }
            if let Some(vulns) = inner.vulnerabilities.remove(&key) {
                stats.vulnerabilities_deleted += vulns.len() as u64;
            }
        }
        Ok(stats)
    }

    async fn list_packages(&self, digest: &Digest) -> Result<Vec<PackageRow>> {
        Ok(self
            .inner
            .lock()
            .packages
            .get(&digest.key())
            .cloned()
            .unwrap_or_default())
    }

    async fn list_vulnerabilities(&self, digest: &Digest) -> Result<Vec<VulnerabilityRow>> {
        Ok(self
            .inner
            .lock()
            .vulnerabilities
            .get(&digest.key())
            .cloned()
            .unwrap_or_default())
    }

    async fn get_vulndb_built_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().vulndb_built_at)
    }

    async fn set_vulndb_built_at(&self, built_at: DateTime<Utc>) -> Result<()> {
        self.inner.lock().vulndb_built_at = Some(built_at);
        Ok(())
    }

    async fn get_staleness_blob(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().staleness_blob.clone())
    }

    async fn set_staleness_blob(&self, blob: Vec<u8>) -> Result<()> {
        self.inner.lock().staleness_blob = Some(blob);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ImageRef, Runtime};

    fn sample_digest() -> Digest {
        Digest::parse(&format!("sha256:{}", "a".repeat(64))).unwrap()
    }

    #[tokio::test]
    async fn ensure_image_record_is_idempotent() {
        let store = MemoryStore::new();
        let digest = sample_digest();
        assert!(store.ensure_image_record(&digest, "nginx:1.21").await.unwrap());
        assert!(!store.ensure_image_record(&digest, "nginx:1.21").await.unwrap());
        assert_eq!(store.list_image_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_cascades_packages_and_vulnerabilities() {
        let store = MemoryStore::new();
        let digest = sample_digest();
        store.ensure_image_record(&digest, "nginx:1.21").await.unwrap();
        store
            .store_sbom(
                &digest,
                b"sbom".to_vec(),
                vec![PackageRow {
                    digest: digest.clone(),
                    name: "libc".into(),
                    version: "2.31".into(),
                    package_type: "deb".into(),
                    purl: None,
                }],
                Some("debian".into()),
                Some("12".into()),
            )
            .await
            .unwrap();
        store
            .store_vulnerabilities(
                &digest,
                b"findings".to_vec(),
                vec![VulnerabilityRow {
                    digest: digest.clone(),
                    cve_id: "CVE-2024-0001".into(),
                    severity: "high".into(),
                    fix_status: "fixed".into(),
                    fixed_version: Some("2.32".into()),
                    package_name: "libc".into(),
                    package_version: "2.31".into(),
                    known_exploited: false,
                    risk_score: 7.5,
                    count: 1,
                }],
                Utc::now(),
            )
            .await
            .unwrap();

        // No container references this digest: it's orphaned from the start.
        let stats = store.cleanup_orphaned_images().await.unwrap();
        assert_eq!(stats.images_deleted, 1);
        assert_eq!(stats.packages_deleted, 1);
        assert_eq!(stats.vulnerabilities_deleted, 1);
        assert!(store.get_image_record(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_preserves_referenced_images() {
        let store = MemoryStore::new();
        let digest = sample_digest();
        store.ensure_image_record(&digest, "nginx:1.21").await.unwrap();
        let container = Container::new(
            ContainerId::new("default", "web-1", "nginx"),
            ImageRef {
                reference: "nginx:1.21".into(),
                digest: digest.clone(),
            },
            "node-a".into(),
            Runtime::Containerd,
        );
        store.upsert_container(&container).await.unwrap();
        let stats = store.cleanup_orphaned_images().await.unwrap();
        assert_eq!(stats.images_deleted, 0);
        assert!(store.get_image_record(&digest).await.unwrap().is_some());
    }
}
