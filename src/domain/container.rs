use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ImageRef;

/// Stable identity of a live container observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    pub namespace: String,
    pub pod: String,
    pub container_name: String,
}

impl ContainerId {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        ContainerId {
            namespace: namespace.into(),
            pod: pod.into(),
            container_name: container_name.into(),
        }
    }
}

/// The container runtime a `Container` was observed on. `Unknown` is used
/// when the `containerID` prefix doesn't match a recognized runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runtime {
    Docker,
    Containerd,
    CriO,
    Unknown,
}

impl Runtime {
    /// Classify a Kubernetes `containerID` by its scheme prefix
    /// (`docker://`, `containerd://`, `cri-o://`).
    pub fn from_container_id_prefix(container_id: &str) -> Runtime {
        if container_id.starts_with("docker://") {
            Runtime::Docker
        } else if container_id.starts_with("containerd://") {
            Runtime::Containerd
        } else if container_id.starts_with("cri-o://") {
            Runtime::CriO
        } else {
            Runtime::Unknown
        }
    }
}

/// A live container observation: identity, the image it runs, and the
/// node/runtime it runs on. Created on first "add" where the runtime has
/// reported a digest; destroyed on "delete" or the pod's first non-running
/// phase observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub image: ImageRef,
    pub node_name: String,
    pub runtime: Runtime,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Container {
    pub fn new(id: ContainerId, image: ImageRef, node_name: String, runtime: Runtime) -> Self {
        let now = Utc::now();
        Container {
            id,
            image,
            node_name,
            runtime,
            first_seen: now,
            last_seen: now,
        }
    }
}
