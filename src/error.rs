//! Error taxonomy for the core, mirroring the categories in the error-handling
//! design: observation-incomplete, transient I/O, scan-stage failure,
//! invariant violation, and fatal init. Call sites match on variant rather
//! than inspecting message strings.

use crate::domain::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An observation was dropped because it was structurally incomplete
    /// (e.g. no digest yet). Never escalated; the watcher is expected to
    /// re-deliver once the runtime fills in the missing field.
    #[error("incomplete observation: {0}")]
    Observation(String),

    /// A transient I/O failure (watch channel closed, HTTP 5xx, feed
    /// timeout). Callers should back off and retry at the next tick rather
    /// than propagate.
    #[error("transient I/O failure: {0}")]
    Transient(String),

    /// A scan stage (SBOM generation or vulnerability matching) failed for
    /// a specific image digest. Carries the digest so the worker can record
    /// it against the right `ImageRecord`.
    #[error("scan stage failed for {digest}: {message}")]
    ScanStage { digest: Digest, message: String },

    /// An invariant was violated (bad digest format, duplicate job name,
    /// store corruption). The operation is refused and logged.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Unrecoverable initialization failure (no container runtime
    /// reachable, cannot create the vulnerability-DB directory). Surfaced
    /// to the embedding process, typically fatal to `main`.
    #[error("fatal initialization error: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
