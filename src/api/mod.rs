//! Thin health/readiness/metrics HTTP surface. Out of scope beyond this
//! interface contract per the purpose/scope section; real Prometheus/OTLP
//! exporting is not implemented here, only the seam.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::Filter;

use crate::metrics::MetricStalenessTracker;
use crate::queue::ScanQueue;
use crate::vulndb::AtomicReadiness;

pub struct ApiServer {
    addr: SocketAddr,
    readiness: Arc<AtomicReadiness>,
    queue: Arc<ScanQueue>,
    staleness: Arc<MetricStalenessTracker>,
}

impl ApiServer {
    pub fn new(
        addr: SocketAddr,
        readiness: Arc<AtomicReadiness>,
        queue: Arc<ScanQueue>,
        staleness: Arc<MetricStalenessTracker>,
    ) -> Self {
        ApiServer {
            addr,
            readiness,
            queue,
            staleness,
        }
    }

    pub async fn run(&self, cancellation: CancellationToken) {
        let healthz = warp::path("healthz").map(|| "ok");

        let readiness = self.readiness.clone();
        let readyz = warp::path("readyz").map(move || {
            if readiness.is_ready() {
                warp::reply::with_status("ready", warp::http::StatusCode::OK)
            } else {
                warp::reply::with_status("not ready", warp::http::StatusCode::SERVICE_UNAVAILABLE)
            }
        });

        let queue = self.queue.clone();
        let staleness = self.staleness.clone();
        let metrics = warp::path("metrics").map(move || {
            let snapshot = queue.metrics().snapshot();
            render_metrics(&snapshot, staleness.tracked_count())
        });

        let routes = healthz.or(readyz).or(metrics);

        info!(addr = %self.addr, "API server listening");
        let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(self.addr, async move {
            cancellation.cancelled().await;
        });
        server.await;
    }
}

fn render_metrics(snapshot: &crate::queue::QueueMetricsSnapshot, staleness_tracked: usize) -> String {
    format!(
        "vulnwatch_queue_current_depth {}\n\
         vulnwatch_queue_peak_depth {}\n\
         vulnwatch_queue_total_enqueued {}\n\
         vulnwatch_queue_total_dropped {}\n\
         vulnwatch_queue_total_processed {}\n\
         vulnwatch_staleness_tracked_points {}\n",
        snapshot.current_depth,
        snapshot.peak_depth,
        snapshot.total_enqueued,
        snapshot.total_dropped,
        snapshot.total_processed,
        staleness_tracked,
    )
}
