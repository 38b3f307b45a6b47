//! SBOM Retriever port: given an image digest and the node/runtime it was
//! observed on, returns SBOM bytes. In-cluster callers dispatch over HTTP to
//! a per-node sidecar; single-host callers would call a local runtime
//! directly (not implemented here — out of scope per the purpose/scope
//! section, which treats the per-node generator as an opaque collaborator).

mod http_dispatcher;

pub use http_dispatcher::{HttpSbomRetriever, NodeAddressResolver, StaticAddressBook};

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{ImageRef, Runtime};
use crate::error::Result;

/// The worker enforces its own 5-minute deadline around this call; the
/// reference HTTP dispatcher additionally sets its own client timeout
/// slightly longer than that by design (see `HttpSbomRetriever`), so a
/// slow-but-alive sidecar produces a dispatcher-level error before the
/// worker's deadline silently races it.
pub const WORKER_SBOM_DEADLINE: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait SbomRetriever: Send + Sync {
    async fn retrieve(&self, image: &ImageRef, node_name: &str, runtime: Runtime) -> Result<Vec<u8>>;
}

/// A minimal parse of an SBOM document sufficient for the worker: packages
/// and optional OS metadata. Real parsing of CycloneDX/Syft JSON is the
/// Grype/Syft library's job (opaque per scope); this is the shape the
/// worker needs out of whichever schema was returned.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ParsedSbom {
    #[serde(default)]
    pub packages: Vec<SbomPackage>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SbomPackage {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub package_type: String,
    #[serde(default)]
    pub purl: Option<String>,
}

/// Parse SBOM bytes into the worker's minimal shape. Accepts the
/// reduced JSON shape produced by `ParsedSbom`'s derive; a production
/// implementation would branch on CycloneDX vs. Syft-native schema here.
pub fn parse_sbom(bytes: &[u8]) -> Result<ParsedSbom> {
    serde_json::from_slice(bytes)
        .map_err(|e| crate::error::Error::Invariant(format!("unparseable SBOM document: {e}")))
}
