use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, instrument};

use super::SbomRetriever;
use crate::domain::{ImageRef, Runtime};
use crate::error::{Error, Result};

/// Resolves a node name to the address of the per-node SBOM sidecar running
/// there. In cluster deployments this is typically backed by a DaemonSet's
/// pod-IP-by-node index; `StaticAddressBook` is a test/single-node stand-in.
#[async_trait]
pub trait NodeAddressResolver: Send + Sync {
    async fn resolve(&self, node_name: &str) -> Result<IpAddr>;
}

/// A fixed, caller-populated node → sidecar-address map.
pub struct StaticAddressBook {
    addresses: RwLock<HashMap<String, IpAddr>>,
}

impl StaticAddressBook {
    pub fn new() -> Self {
        StaticAddressBook {
            addresses: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, node_name: impl Into<String>, addr: IpAddr) {
        self.addresses.write().insert(node_name.into(), addr);
    }
}

impl Default for StaticAddressBook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeAddressResolver for StaticAddressBook {
    async fn resolve(&self, node_name: &str) -> Result<IpAddr> {
        self.addresses
            .read()
            .get(node_name)
            .copied()
            .ok_or_else(|| Error::Transient(format!("no sidecar address known for node {node_name}")))
    }
}

/// Reference dispatcher: locates the per-node sidecar via
/// `NodeAddressResolver` and issues `GET http://{addr}:{port}/sbom/{digest}`.
/// The HTTP client timeout (6 minutes) is deliberately longer than the
/// worker's own 5-minute deadline — the worker's `tokio::time::timeout`
/// wins the race in the common case, and the longer client timeout just
/// avoids leaking the in-flight request indefinitely if the worker's
/// deadline somehow doesn't fire.
pub struct HttpSbomRetriever {
    client: reqwest::Client,
    resolver: std::sync::Arc<dyn NodeAddressResolver>,
    sidecar_port: u16,
}

impl HttpSbomRetriever {
    pub fn new(resolver: std::sync::Arc<dyn NodeAddressResolver>, sidecar_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(6 * 60))
            .build()
            .map_err(|e| Error::Fatal(format!("failed to build SBOM retriever HTTP client: {e}")))?;
        Ok(HttpSbomRetriever {
            client,
            resolver,
            sidecar_port,
        })
    }
}

#[async_trait]
impl SbomRetriever for HttpSbomRetriever {
    #[instrument(skip(self, image), fields(digest = %image.digest, node = %node_name))]
    async fn retrieve(&self, image: &ImageRef, node_name: &str, _runtime: Runtime) -> Result<Vec<u8>> {
        let addr = self.resolver.resolve(node_name).await?;
        let url = format!(
            "http://{addr}:{port}/sbom/{digest}",
            port = self.sidecar_port,
            digest = image.digest
        );
        debug!(url = %url, "dispatching SBOM request");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("SBOM request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let prefix: String = body.chars().take(256).collect();
            return Err(Error::ScanStage {
                digest: image.digest.clone(),
                message: format!("sidecar returned {status}: {prefix}"),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Transient(format!("failed to read SBOM body from {url}: {e}")))
    }
}
