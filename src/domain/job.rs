use serde::{Deserialize, Serialize};

use super::{Digest, ImageRef, Runtime};

/// An ephemeral unit of scan work. Lives only inside the queue; never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub image: ImageRef,
    pub node_hint: String,
    pub runtime_hint: Runtime,
    pub force: bool,
}

impl ScanJob {
    pub fn new(image: ImageRef, node_hint: impl Into<String>, runtime_hint: Runtime) -> Self {
        ScanJob {
            image,
            node_hint: node_hint.into(),
            runtime_hint,
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// A package derived from an image's SBOM. Deleted when the owning
/// `ImageRecord` is deleted (cascades with it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRow {
    pub digest: Digest,
    pub name: String,
    pub version: String,
    pub package_type: String,
    pub purl: Option<String>,
}

/// A vulnerability finding derived from a vulnerability-match run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityRow {
    pub digest: Digest,
    pub cve_id: String,
    pub severity: String,
    pub fix_status: String,
    pub fixed_version: Option<String>,
    pub package_name: String,
    pub package_version: String,
    pub known_exploited: bool,
    pub risk_score: f64,
    pub count: u32,
}
