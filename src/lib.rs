//! Cluster-wide container image vulnerability scanner library. Watches
//! running containers, drives SBOM generation and vulnerability matching
//! through a bounded work queue, and keeps findings fresh against a local
//! vulnerability database on a fixed schedule.

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod sbom;
pub mod scheduler;
pub mod store;
pub mod vulndb;
pub mod watcher;
pub mod worker;

#[cfg(feature = "api")]
pub mod api;

pub use config::Config;
pub use controller::Controller;
pub use error::{Error, Result};
