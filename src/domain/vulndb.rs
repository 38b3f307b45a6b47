use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot of the on-disk vulnerability database. The persisted `built_at`
/// mirrors the actual on-disk database file, never any cached metadata from
/// the downloader (see the Vulnerability DB Manager's stale-timestamp
/// hazard note).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnDbState {
    pub built_at: DateTime<Utc>,
    pub schema_version: String,
    pub path: PathBuf,
    pub ready: bool,
}
