//! SQLite-backed `PersistentStore`. Uses the runtime-checked `sqlx::query`
//! API (not `query!`) so the crate builds without a live database at
//! compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::{CleanupStats, PersistentStore};
use crate::domain::{
    Container, ContainerId, Digest, ImageRecord, ImageStatus, PackageRow, Runtime,
    VulnerabilityRow,
};
use crate::error::{Error, Result};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| Error::Fatal(format!("invalid store path {}: {e}", path.display())))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| Error::Fatal(format!("failed to open persistent store: {e}")))?;
        let store = SqliteStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                namespace TEXT NOT NULL,
                pod TEXT NOT NULL,
                container_name TEXT NOT NULL,
                reference TEXT NOT NULL,
                digest TEXT NOT NULL,
                node_name TEXT NOT NULL,
                runtime TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (namespace, pod, container_name)
            );

            CREATE TABLE IF NOT EXISTS image_records (
                digest TEXT PRIMARY KEY,
                reference TEXT NOT NULL,
                status_json TEXT NOT NULL,
                sbom BLOB,
                sbom_produced_at TEXT,
                vulnerabilities BLOB,
                vulnerabilities_produced_at TEXT,
                grype_db_built_at TEXT,
                os_name TEXT,
                os_version TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS packages (
                digest TEXT NOT NULL,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                package_type TEXT NOT NULL,
                purl TEXT,
                PRIMARY KEY (digest, name, version, package_type)
            );

            CREATE TABLE IF NOT EXISTS vulnerabilities (
                digest TEXT NOT NULL,
                cve_id TEXT NOT NULL,
                severity TEXT NOT NULL,
                fix_status TEXT NOT NULL,
                fixed_version TEXT,
                package_name TEXT NOT NULL,
                package_version TEXT NOT NULL,
                known_exploited INTEGER NOT NULL,
                risk_score REAL NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (digest, cve_id, package_name, package_version)
            );

            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_image_record(row: &sqlx::sqlite::SqliteRow) -> Result<ImageRecord> {
        let digest_str: String = row.try_get("digest")?;
        let digest = Digest::parse(&digest_str)?;
        let status_json: String = row.try_get("status_json")?;
        let status: ImageStatus = serde_json::from_str(&status_json)
            .map_err(|e| Error::Invariant(format!("corrupt status for {digest_str}: {e}")))?;
        Ok(ImageRecord {
            digest,
            reference: row.try_get("reference")?,
            status,
            sbom: row.try_get("sbom")?,
            sbom_produced_at: row.try_get("sbom_produced_at")?,
            vulnerabilities: row.try_get("vulnerabilities")?,
            vulnerabilities_produced_at: row.try_get("vulnerabilities_produced_at")?,
            grype_db_built_at: row.try_get("grype_db_built_at")?,
            os_name: row.try_get("os_name")?,
            os_version: row.try_get("os_version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn upsert_container(&self, container: &Container) -> Result<()> {
        let runtime = runtime_to_str(container.runtime);
        sqlx::query(
            r#"INSERT INTO containers
                (namespace, pod, container_name, reference, digest, node_name, runtime, first_seen, last_seen)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(namespace, pod, container_name) DO UPDATE SET
                 reference = excluded.reference,
                 digest = excluded.digest,
                 node_name = excluded.node_name,
                 runtime = excluded.runtime,
                 last_seen = excluded.last_seen"#,
        )
        .bind(&container.id.namespace)
        .bind(&container.id.pod)
        .bind(&container.id.container_name)
        .bind(&container.image.reference)
        .bind(container.image.digest.key())
        .bind(&container.node_name)
        .bind(runtime)
        .bind(container.first_seen)
        .bind(container.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        sqlx::query(
            "DELETE FROM containers WHERE namespace = ? AND pod = ? AND container_name = ?",
        )
        .bind(&id.namespace)
        .bind(&id.pod)
        .bind(&id.container_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let rows = sqlx::query("SELECT * FROM containers")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let digest_str: String = row.try_get("digest")?;
                Ok(Container {
                    id: ContainerId::new(
                        row.try_get::<String, _>("namespace")?,
                        row.try_get::<String, _>("pod")?,
                        row.try_get::<String, _>("container_name")?,
                    ),
                    image: crate::domain::ImageRef {
                        reference: row.try_get("reference")?,
                        digest: Digest::parse(&digest_str)?,
                    },
                    node_name: row.try_get("node_name")?,
                    runtime: runtime_from_str(&row.try_get::<String, _>("runtime")?),
                    first_seen: row.try_get("first_seen")?,
                    last_seen: row.try_get("last_seen")?,
                })
            })
            .collect()
    }

    async fn count_containers_for_digest(&self, digest: &Digest) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM containers WHERE digest = ?")
            .bind(digest.key())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn ensure_image_record(&self, digest: &Digest, reference: &str) -> Result<bool> {
        let existing = sqlx::query("SELECT digest FROM image_records WHERE digest = ?")
            .bind(digest.key())
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Ok(false);
        }
        let now = Utc::now();
        let status_json = serde_json::to_string(&ImageStatus::Pending)
            .map_err(|e| Error::Invariant(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO image_records
                (digest, reference, status_json, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(digest) DO NOTHING"#,
        )
        .bind(digest.key())
        .bind(reference)
        .bind(status_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn get_image_record(&self, digest: &Digest) -> Result<Option<ImageRecord>> {
        let row = sqlx::query("SELECT * FROM image_records WHERE digest = ?")
            .bind(digest.key())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_image_record).transpose()
    }

    async fn list_image_records(&self) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query("SELECT * FROM image_records")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_image_record).collect()
    }

    async fn list_image_records_built_before(
        &self,
        built_at: DateTime<Utc>,
    ) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM image_records WHERE grype_db_built_at IS NULL OR grype_db_built_at < ?",
        )
        .bind(built_at)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_image_record).collect()
    }

    async fn set_status(&self, digest: &Digest, status: ImageStatus) -> Result<()> {
        let status_json = serde_json::to_string(&status).map_err(|e| Error::Invariant(e.to_string()))?;
        sqlx::query("UPDATE image_records SET status_json = ?, updated_at = ? WHERE digest = ?")
            .bind(status_json)
            .bind(Utc::now())
            .bind(digest.key())
            .execute(&self.pool)
            .await?;
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
        let mut tx = self.pool.begin().await?;
        let status_json = serde_json::to_string(&ImageStatus::ScanningVulnerabilities)
            .map_err(|e| Error::Invariant(e.to_string()))?;
        sqlx::query(
            r#"UPDATE image_records SET status_json = ?, sbom = ?, sbom_produced_at = ?,
                 os_name = ?, os_version = ?, updated_at = ?
               WHERE digest = ?"#,
        )
        .bind(status_json)
        .bind(&sbom)
        .bind(Utc::now())
        .bind(os_name)
        .bind(os_version)
        .bind(Utc::now())
        .bind(digest.key())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM packages WHERE digest = ?")
            .bind(digest.key())
            .execute(&mut *tx)
            .await?;
        for package in &packages {
            sqlx::query(
                "INSERT INTO packages (digest, name, version, package_type, purl) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(digest.key())
            .bind(&package.name)
            .bind(&package.version)
            .bind(&package.package_type)
            .bind(&package.purl)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store_vulnerabilities(
        &self,
        digest: &Digest,
        findings: Vec<u8>,
        rows: Vec<VulnerabilityRow>,
        grype_built_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status_json = serde_json::to_string(&ImageStatus::Completed)
            .map_err(|e| Error::Invariant(e.to_string()))?;
        sqlx::query(
            r#"UPDATE image_records SET status_json = ?, vulnerabilities = ?,
                 vulnerabilities_produced_at = ?, grype_db_built_at = ?, updated_at = ?
               WHERE digest = ?"#,
        )
        .bind(status_json)
        .bind(&findings)
        .bind(Utc::now())
        .bind(grype_built_at)
        .bind(Utc::now())
        .bind(digest.key())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM vulnerabilities WHERE digest = ?")
            .bind(digest.key())
            .execute(&mut *tx)
            .await?;
        for row in &rows {
            sqlx::query(
                r#"INSERT INTO vulnerabilities
                    (digest, cve_id, severity, fix_status, fixed_version, package_name,
                     package_version, known_exploited, risk_score, count)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(digest.key())
            .bind(&row.cve_id)
            .bind(&row.severity)
            .bind(&row.fix_status)
            .bind(&row.fixed_version)
            .bind(&row.package_name)
            .bind(&row.package_version)
            .bind(row.known_exploited)
            .bind(row.risk_score)
            .bind(row.count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_orphaned_images(&self) -> Result<CleanupStats> {
        let mut tx = self.pool.begin().await?;
        let orphaned_rows = sqlx::query(
            r#"SELECT digest FROM image_records
               WHERE digest NOT IN (SELECT DISTINCT digest FROM containers)"#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut stats = CleanupStats::default();
        for row in orphaned_rows {
            let digest: String = row.try_get("digest")?;
            let packages = sqlx::query("DELETE FROM packages WHERE digest = ?")
                .bind(&digest)
                .execute(&mut *tx)
                .await?;
            let vulns = sqlx::query("DELETE FROM vulnerabilities WHERE digest = ?")
                .bind(&digest)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM image_records WHERE digest = ?")
                .bind(&digest)
                .execute(&mut *tx)
                .await?;
            stats.images_deleted += 1;
            stats.packages_deleted += packages.rows_affected();
            stats.vulnerabilities_deleted += vulns.rows_affected();
        }
        tx.commit().await?;
        Ok(stats)
    }

    async fn list_packages(&self, digest: &Digest) -> Result<Vec<PackageRow>> {
        let rows = sqlx::query("SELECT * FROM packages WHERE digest = ?")
            .bind(digest.key())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(PackageRow {
                    digest: digest.clone(),
                    name: row.try_get("name")?,
                    version: row.try_get("version")?,
                    package_type: row.try_get("package_type")?,
                    purl: row.try_get("purl")?,
                })
            })
            .collect()
    }

    async fn list_vulnerabilities(&self, digest: &Digest) -> Result<Vec<VulnerabilityRow>> {
        let rows = sqlx::query("SELECT * FROM vulnerabilities WHERE digest = ?")
            .bind(digest.key())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(VulnerabilityRow {
                    digest: digest.clone(),
                    cve_id: row.try_get("cve_id")?,
                    severity: row.try_get("severity")?,
                    fix_status: row.try_get("fix_status")?,
                    fixed_version: row.try_get("fixed_version")?,
                    package_name: row.try_get("package_name")?,
                    package_version: row.try_get("package_version")?,
                    known_exploited: row.try_get("known_exploited")?,
                    risk_score: row.try_get("risk_score")?,
                    count: row.try_get::<i64, _>("count")? as u32,
                })
            })
            .collect()
    }

    async fn get_vulndb_built_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = 'vulndb_built_at'")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: Vec<u8> = row.try_get("value")?;
                let text = String::from_utf8_lossy(&value);
                let parsed = DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| Error::Invariant(format!("corrupt vulndb timestamp: {e}")))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    async fn set_vulndb_built_at(&self, built_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO kv (key, value) VALUES ('vulndb_built_at', ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(built_at.to_rfc3339().into_bytes())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_staleness_blob(&self) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = 'staleness_blob'")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn set_staleness_blob(&self, blob: Vec<u8>) -> Result<()> {
        sqlx::query("INSERT INTO kv (key, value) VALUES ('staleness_blob', ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(blob)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn runtime_to_str(runtime: Runtime) -> &'static str {
    match runtime {
        Runtime::Docker => "docker",
        Runtime::Containerd => "containerd",
        Runtime::CriO => "cri-o",
        Runtime::Unknown => "unknown",
    }
}

fn runtime_from_str(value: &str) -> Runtime {
    match value {
        "docker" => Runtime::Docker,
        "containerd" => Runtime::Containerd,
        "cri-o" => Runtime::CriO,
        _ => Runtime::Unknown,
    }
}
