//! Vulnerability DB Manager: tracks the on-disk vulnerability database,
//! checks a remote feed for updates, and exposes both its current build
//! timestamp and a readiness signal.
//!
//! The stale-timestamp hazard called out in the design notes governs this
//! module's whole shape: the *authoritative* build timestamp is always read
//! from the on-disk description file, never from the distribution client's
//! returned metadata (which has been observed to lag the file after an
//! update), and the comparison baseline across restarts is the persisted
//! timestamp in the store, never the in-memory `last_state` cache (which
//! could itself have been seeded from stale downloader metadata on a prior
//! run).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::VulnDbState;
use crate::error::{Error, Result};
use crate::store::PersistentStore;

/// Descriptor of an available remote vulnerability-database archive.
#[derive(Debug, Clone)]
pub struct DbDescriptor {
    pub schema_version: String,
    pub built_at: DateTime<Utc>,
    pub url: String,
    pub checksum: String,
}

/// Reads the on-disk description file's `built` timestamp — the single
/// source of truth for "what database is actually on disk right now."
#[async_trait]
pub trait DescriptionReader: Send + Sync {
    async fn read_built_at(&self, db_dir: &Path) -> Result<Option<(DateTime<Utc>, String)>>;
}

/// Asks the remote feed whether a newer archive than `current` exists.
#[async_trait]
pub trait DistributionClient: Send + Sync {
    async fn check_for_update(&self, current: Option<DateTime<Utc>>) -> Result<Option<DbDescriptor>>;
}

/// Downloads and installs a described archive into `db_dir`.
#[async_trait]
pub trait DatabaseLoader: Send + Sync {
    async fn install(&self, descriptor: &DbDescriptor, db_dir: &Path) -> Result<()>;
}

/// Process-level readiness signal. True iff the vulnerability DB is loaded
/// and usable; the embedding process's `/readyz` probe consults this.
pub trait ReadinessSetter: Send + Sync {
    fn set_ready(&self, ready: bool);
}

/// A simple shared boolean, the reference `ReadinessSetter`.
#[derive(Default)]
pub struct AtomicReadiness(std::sync::atomic::AtomicBool);

impl AtomicReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl ReadinessSetter for AtomicReadiness {
    fn set_ready(&self, ready: bool) {
        self.0.store(ready, std::sync::atomic::Ordering::Release);
    }
}

/// Feed polls are bounded: the HTTP client itself enforces a 30s timeout
/// per attempt (`HttpDistributionClient::new`), and this caps the whole
/// check at a handful of attempts rather than retrying forever.
const MAX_FEED_POLL_ATTEMPTS: u32 = 3;

pub struct VulnDbManager {
    db_dir: PathBuf,
    description_reader: Arc<dyn DescriptionReader>,
    distribution_client: Arc<dyn DistributionClient>,
    loader: Arc<dyn DatabaseLoader>,
    readiness: Arc<dyn ReadinessSetter>,
    store: Arc<dyn PersistentStore>,
    feed_poll_interval: std::time::Duration,
    last_state: Mutex<Option<VulnDbState>>,
}

impl VulnDbManager {
    pub fn new(
        db_dir: PathBuf,
        description_reader: Arc<dyn DescriptionReader>,
        distribution_client: Arc<dyn DistributionClient>,
        loader: Arc<dyn DatabaseLoader>,
        readiness: Arc<dyn ReadinessSetter>,
        store: Arc<dyn PersistentStore>,
        feed_poll_interval: std::time::Duration,
    ) -> Self {
        VulnDbManager {
            db_dir,
            description_reader,
            distribution_client,
            loader,
            readiness,
            store,
            feed_poll_interval,
            last_state: Mutex::new(None),
        }
    }

    /// A copy (never a shared reference) of the last-observed state, or
    /// `None` if no successful check has happened yet.
    pub fn current_version(&self) -> Option<VulnDbState> {
        self.last_state.lock().clone()
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Polls the distribution client for an update, retrying up to
    /// `MAX_FEED_POLL_ATTEMPTS` times with `feed_poll_interval` between
    /// attempts on failure. The last error is returned if every attempt
    /// fails.
    async fn poll_feed_with_retry(&self, current: Option<DateTime<Utc>>) -> Result<Option<DbDescriptor>> {
        let mut attempt = 1;
        loop {
            match self.distribution_client.check_for_update(current).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < MAX_FEED_POLL_ATTEMPTS => {
                    warn!(attempt, error = %e, "vulnerability-DB feed poll failed, retrying after configured interval");
                    tokio::time::sleep(self.feed_poll_interval).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns `(changed, new_built_at)` where `changed` is true iff a
    /// database existed before this call *and* its build timestamp moved.
    pub async fn check_for_updates(&self) -> Result<(bool, DateTime<Utc>)> {
        let before = self.description_reader.read_built_at(&self.db_dir).await?;
        let existed_before = before.is_some();

        if let Some(descriptor) = self
            .poll_feed_with_retry(before.as_ref().map(|(t, _)| *t))
            .await?
        {
            info!(new_built_at = %descriptor.built_at, "newer vulnerability database available, reinstalling");
            if self.db_dir.exists() {
                tokio::fs::remove_dir_all(&self.db_dir)
                    .await
                    .map_err(|e| Error::Transient(format!("failed to clear stale DB directory: {e}")))?;
            }
            self.loader.install(&descriptor, &self.db_dir).await?;
        }

        let after = self
            .description_reader
            .read_built_at(&self.db_dir)
            .await?
            .ok_or_else(|| Error::Fatal("vulnerability database directory has no usable description after install".into()))?;
        let (new_built_at, schema_version) = after;

        let stored_built_at = self.store.get_vulndb_built_at().await?;
        let changed = existed_before && stored_built_at != Some(new_built_at);

        self.store.set_vulndb_built_at(new_built_at).await?;

        let state = VulnDbState {
            built_at: new_built_at,
            schema_version,
            path: self.db_dir.clone(),
            ready: true,
        };
        *self.last_state.lock() = Some(state);
        self.readiness.set_ready(true);

        Ok((changed, new_built_at))
    }
}

/// Distribution client backed by a JSON feed endpoint returning
/// `{schemaVersion, built, path, checksum}`.
pub struct HttpDistributionClient {
    client: reqwest::Client,
    feed_url: String,
}

impl HttpDistributionClient {
    pub fn new(feed_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Fatal(format!("failed to build vulnerability-DB feed client: {e}")))?;
        Ok(HttpDistributionClient {
            client,
            feed_url: feed_url.into(),
        })
    }
}

#[derive(serde::Deserialize)]
struct FeedDescriptor {
    #[serde(rename = "schemaVersion")]
    schema_version: String,
    built: DateTime<Utc>,
    path: String,
    checksum: Option<String>,
}

#[async_trait]
impl DistributionClient for HttpDistributionClient {
    async fn check_for_update(&self, current: Option<DateTime<Utc>>) -> Result<Option<DbDescriptor>> {
        let response = self
            .client
            .get(&self.feed_url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("vulnerability-DB feed request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "vulnerability-DB feed returned {}",
                response.status()
            )));
        }
        let descriptor: FeedDescriptor = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("malformed vulnerability-DB feed response: {e}")))?;
        let checksum = descriptor
            .checksum
            .ok_or_else(|| Error::Invariant("vulnerability-DB feed descriptor missing checksum".into()))?;

        if current.map(|c| descriptor.built > c).unwrap_or(true) {
            Ok(Some(DbDescriptor {
                schema_version: descriptor.schema_version,
                built_at: descriptor.built,
                url: descriptor.path,
                checksum,
            }))
        } else {
            Ok(None)
        }
    }
}

/// Reads `{db_dir}/metadata.json` for `{"schemaVersion": ..., "built": ...}`,
/// the on-disk description file the manager treats as authoritative.
pub struct FileDescriptionReader;

#[async_trait]
impl DescriptionReader for FileDescriptionReader {
    async fn read_built_at(&self, db_dir: &Path) -> Result<Option<(DateTime<Utc>, String)>> {
        let path = db_dir.join("metadata.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                #[derive(serde::Deserialize)]
                struct Metadata {
                    #[serde(rename = "schemaVersion")]
                    schema_version: String,
                    built: DateTime<Utc>,
                }
                let metadata: Metadata = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Invariant(format!("corrupt vulnerability-DB description at {path:?}: {e}"))
                })?;
                Ok(Some((metadata.built, metadata.schema_version)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Transient(format!("failed to read {path:?}: {e}"))),
        }
    }
}

/// Downloads the archive over HTTP and writes a fresh `metadata.json`
/// alongside it. Archive-format unpacking (tar/zstd as Grype's distribution
/// format actually uses) is left as the integration seam a real deployment
/// wires in; this loader's job is to land the bytes and description file
/// such intentionally that `FileDescriptionReader` becomes authoritative
/// immediately afterward.
pub struct HttpDatabaseLoader {
    client: reqwest::Client,
}

impl HttpDatabaseLoader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10 * 60))
            .build()
            .map_err(|e| Error::Fatal(format!("failed to build vulnerability-DB loader client: {e}")))?;
        Ok(HttpDatabaseLoader { client })
    }
}

#[async_trait]
impl DatabaseLoader for HttpDatabaseLoader {
    async fn install(&self, descriptor: &DbDescriptor, db_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(db_dir)
            .await
            .map_err(|e| Error::Fatal(format!("failed to create vulnerability-DB directory: {e}")))?;

        let response = self
            .client
            .get(&descriptor.url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("failed to download vulnerability-DB archive: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "vulnerability-DB archive download returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transient(format!("failed to read vulnerability-DB archive body: {e}")))?;

        tokio::fs::write(db_dir.join("vulnerability.db"), &bytes)
            .await
            .map_err(|e| Error::Transient(format!("failed to write vulnerability-DB archive: {e}")))?;

        let metadata = serde_json::json!({
            "schemaVersion": descriptor.schema_version,
            "built": descriptor.built_at.to_rfc3339(),
            "checksum": descriptor.checksum,
        });
        tokio::fs::write(
            db_dir.join("metadata.json"),
            serde_json::to_vec_pretty(&metadata).unwrap(),
        )
        .await
        .map_err(|e| Error::Transient(format!("failed to write vulnerability-DB metadata: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct FixedFeed(Option<DbDescriptor>);

    #[async_trait]
    impl DistributionClient for FixedFeed {
        async fn check_for_update(&self, _current: Option<DateTime<Utc>>) -> Result<Option<DbDescriptor>> {
            Ok(self.0.clone())
        }
    }

    struct NoopLoader {
        db_dir_seed: DateTime<Utc>,
    }

    #[async_trait]
    impl DatabaseLoader for NoopLoader {
        async fn install(&self, _descriptor: &DbDescriptor, db_dir: &Path) -> Result<()> {
            tokio::fs::create_dir_all(db_dir).await.unwrap();
            let metadata = serde_json::json!({"schemaVersion": "6", "built": self.db_dir_seed.to_rfc3339()});
            tokio::fs::write(db_dir.join("metadata.json"), serde_json::to_vec(&metadata).unwrap())
                .await
                .unwrap();
            Ok(())
        }
    }

    struct FlagReadiness(AtomicBool);

    impl ReadinessSetter for FlagReadiness {
        fn set_ready(&self, ready: bool) {
            self.0.store(ready, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn first_install_is_not_reported_as_changed() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let built_at = Utc::now();
        let manager = VulnDbManager::new(
            dir.path().join("db"),
            Arc::new(FileDescriptionReader),
            Arc::new(FixedFeed(Some(DbDescriptor {
                schema_version: "6".into(),
                built_at,
                url: "https://example.invalid/db.tar".into(),
                checksum: "deadbeef".into(),
            }))),
            Arc::new(NoopLoader { db_dir_seed: built_at }),
            Arc::new(FlagReadiness(AtomicBool::new(false))),
            store,
            std::time::Duration::from_millis(10),
        );

        let (changed, new_built_at) = manager.check_for_updates().await.unwrap();
        assert!(!changed, "first install must not be reported as a change");
        assert_eq!(new_built_at, built_at);
        assert!(manager.current_version().unwrap().ready);
    }

    #[tokio::test]
    async fn subsequent_update_is_reported_as_changed() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(1);

        let manager = VulnDbManager::new(
            dir.path().join("db"),
            Arc::new(FileDescriptionReader),
            Arc::new(FixedFeed(Some(DbDescriptor {
                schema_version: "6".into(),
                built_at: t0,
                url: "https://example.invalid/db.tar".into(),
                checksum: "a".into(),
            }))),
            Arc::new(NoopLoader { db_dir_seed: t0 }),
            Arc::new(FlagReadiness(AtomicBool::new(false))),
            store.clone(),
            std::time::Duration::from_millis(10),
        );
        manager.check_for_updates().await.unwrap();

        let manager2 = VulnDbManager::new(
            dir.path().join("db"),
            Arc::new(FileDescriptionReader),
            Arc::new(FixedFeed(Some(DbDescriptor {
                schema_version: "6".into(),
                built_at: t1,
                url: "https://example.invalid/db.tar".into(),
                checksum: "b".into(),
            }))),
            Arc::new(NoopLoader { db_dir_seed: t1 }),
            Arc::new(FlagReadiness(AtomicBool::new(false))),
            store,
            std::time::Duration::from_millis(10),
        );
        let (changed, new_built_at) = manager2.check_for_updates().await.unwrap();
        assert!(changed);
        assert_eq!(new_built_at, t1);
    }
}
