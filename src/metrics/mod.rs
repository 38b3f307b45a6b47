//! Metric-staleness tracking (invariant-bearing) and the thin `/metrics`
//! text renderer the API layer exposes.

mod staleness;

pub use staleness::{MetricPoint, MetricStalenessTracker};
