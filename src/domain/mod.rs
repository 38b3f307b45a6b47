//! Core entities of the reconciliation engine: stable identities, the
//! per-digest image record and its status machine, derived package and
//! vulnerability rows, and the ephemeral scan job. These are the types every
//! other module (registry, queue, store, scheduler) speaks in.

mod container;
mod image;
mod job;
mod vulndb;

pub use container::{Container, ContainerId, Runtime};
pub use image::{Digest, DigestAlgorithm, ImageRecord, ImageRef, ImageStatus};
pub use job::{PackageRow, ScanJob, VulnerabilityRow};
pub use vulndb::VulnDbState;
