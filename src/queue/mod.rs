//! Single-consumer bounded queue of scan jobs. Enforces no deduplication at
//! enqueue time — the worker is responsible for collapsing duplicate work
//! via the `ImageRecord` status it reads before acting (single-flight per
//! digest, property P2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::domain::ScanJob;
use crate::error::{Error, Result};

/// Behavior when the queue is at `max_depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullBehavior {
    /// Reject the new job, incrementing `dropped`.
    Drop,
    /// Evict the head of the queue to make room, incrementing `dropped`.
    DropOldest,
    /// Block the calling thread until space frees up (or shutdown).
    Block,
}

#[derive(Default)]
struct Counters {
    current_depth: AtomicU64,
    peak_depth: AtomicU64,
    total_enqueued: AtomicU64,
    total_dropped: AtomicU64,
    total_processed: AtomicU64,
}

/// Point-in-time view of the queue's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueMetricsSnapshot {
    pub current_depth: u64,
    pub peak_depth: u64,
    pub total_enqueued: u64,
    pub total_dropped: u64,
    pub total_processed: u64,
}

/// The narrow "can accept scan work" capability other components depend on
/// (the registry, and the scheduler's rescan-on-DB-change job), kept
/// separate from the worker-only dequeue side.
pub trait ScanQueueHandle: Send + Sync {
    fn enqueue(&self, job: ScanJob) -> Result<()>;
}

struct Inner {
    jobs: VecDeque<ScanJob>,
    shutdown: bool,
}

pub struct ScanQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    max_depth: usize,
    full_behavior: FullBehavior,
    counters: Counters,
}

impl ScanQueue {
    /// `max_depth = 0` means unbounded.
    pub fn new(max_depth: usize, full_behavior: FullBehavior) -> Self {
        ScanQueue {
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_depth,
            full_behavior,
            counters: Counters::default(),
        }
    }

    fn is_bounded_full(&self, len: usize) -> bool {
        self.max_depth != 0 && len >= self.max_depth
    }

    fn record_push(&self, new_len: usize) {
        self.counters.current_depth.store(new_len as u64, Ordering::Relaxed);
        self.counters
            .peak_depth
            .fetch_max(new_len as u64, Ordering::Relaxed);
        self.counters.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Push a job, applying the configured full-behavior. No-op on
    /// shutdown.
    pub fn push(&self, job: ScanJob) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.shutdown {
            return Ok(());
        }

        loop {
            if !self.is_bounded_full(guard.jobs.len()) {
                guard.jobs.push_back(job);
                let len = guard.jobs.len();
                self.record_push(len);
                drop(guard);
                self.not_empty.notify_one();
                return Ok(());
            }

            match self.full_behavior {
                FullBehavior::Drop => {
                    self.counters.total_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(digest = %job.image.digest, "scan queue full, dropping job");
                    return Ok(());
                }
                FullBehavior::DropOldest => {
                    guard.jobs.pop_front();
                    self.counters.total_dropped.fetch_add(1, Ordering::Relaxed);
                    guard.jobs.push_back(job);
                    let len = guard.jobs.len();
                    self.record_push(len);
                    drop(guard);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                FullBehavior::Block => {
                    let timed_out = self
                        .not_full
                        .wait_for(&mut guard, Duration::from_millis(250))
                        .timed_out();
                    if guard.shutdown {
                        return Ok(());
                    }
                    let _ = timed_out;
                    // loop back around and re-check capacity
                }
            }
        }
    }

    /// Block the current async task until a job is available or the queue
    /// is shut down. Returns `None` once shut down with no remaining work.
    pub async fn pop(&self) -> Option<ScanJob> {
        loop {
            {
                let mut guard = self.inner.lock();
                if let Some(job) = guard.jobs.pop_front() {
                    let len = guard.jobs.len();
                    drop(guard);
                    self.counters.current_depth.store(len as u64, Ordering::Relaxed);
                    self.not_full.notify_one();
                    return Some(job);
                }
                if guard.shutdown {
                    return None;
                }
            }
            // No job ready: yield briefly rather than busy-spin. A real
            // deployment would park on an async-aware condvar here; the
            // tokio::task::yield_now + short sleep combination keeps this
            // module free of a second, redundant notification primitive.
            tokio::time::sleep(Duration::from_millis(25)).await;
            trace!("scan queue poll: no job ready");
        }
    }

    pub fn mark_processed(&self) {
        self.counters.total_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        let mut guard = self.inner.lock();
        guard.shutdown = true;
        drop(guard);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn metrics(&self) -> QueueMetrics<'_> {
        QueueMetrics { queue: self }
    }
}

impl ScanQueueHandle for ScanQueue {
    fn enqueue(&self, job: ScanJob) -> Result<()> {
        if job.image.digest.hex().is_empty() {
            return Err(Error::Invariant("scan job digest is empty".into()));
        }
        self.push(job)
    }
}

/// Thin read accessor over the queue's atomics, so callers don't need to
/// reach into private fields.
pub struct QueueMetrics<'a> {
    queue: &'a ScanQueue,
}

impl<'a> QueueMetrics<'a> {
    pub fn current_depth(&self) -> u64 {
        self.queue.counters.current_depth.load(Ordering::Relaxed)
    }
    pub fn peak_depth(&self) -> u64 {
        self.queue.counters.peak_depth.load(Ordering::Relaxed)
    }
    pub fn total_enqueued(&self) -> u64 {
        self.queue.counters.total_enqueued.load(Ordering::Relaxed)
    }
    pub fn total_dropped(&self) -> u64 {
        self.queue.counters.total_dropped.load(Ordering::Relaxed)
    }
    pub fn total_processed(&self) -> u64 {
        self.queue.counters.total_processed.load(Ordering::Relaxed)
    }
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            current_depth: self.current_depth(),
            peak_depth: self.peak_depth(),
            total_enqueued: self.total_enqueued(),
            total_dropped: self.total_dropped(),
            total_processed: self.total_processed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Digest, ImageRef, Runtime};

    fn job(seed: char) -> ScanJob {
        ScanJob::new(
            ImageRef {
                reference: "nginx:latest".into(),
                digest: Digest::parse(&format!("sha256:{}", seed.to_string().repeat(64))).unwrap(),
            },
            "node-a",
            Runtime::Containerd,
        )
    }

    #[tokio::test]
    async fn fifo_order() {
        let queue = ScanQueue::new(0, FullBehavior::Drop);
        queue.push(job('a')).unwrap();
        queue.push(job('b')).unwrap();
        let first = queue.pop().await.unwrap();
        assert_eq!(first.image.digest.hex(), "a".repeat(64));
    }

    #[tokio::test]
    async fn drop_behavior_rejects_when_full() {
        let queue = ScanQueue::new(1, FullBehavior::Drop);
        queue.push(job('a')).unwrap();
        queue.push(job('b')).unwrap();
        assert_eq!(queue.metrics().total_dropped(), 1);
        assert_eq!(queue.metrics().current_depth(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_head() {
        let queue = ScanQueue::new(1, FullBehavior::DropOldest);
        queue.push(job('a')).unwrap();
        queue.push(job('b')).unwrap();
        let job = queue.pop().await.unwrap();
        assert_eq!(job.image.digest.hex(), "b".repeat(64));
    }

    #[tokio::test]
    async fn shutdown_makes_enqueue_a_no_op_and_drains_pop() {
        let queue = ScanQueue::new(0, FullBehavior::Drop);
        queue.shutdown();
        queue.push(job('a')).unwrap();
        assert_eq!(queue.metrics().total_enqueued(), 0);
        assert!(queue.pop().await.is_none());
    }
}
