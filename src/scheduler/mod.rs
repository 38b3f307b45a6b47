//! Fixed-interval job runner: named jobs on independent tickers, optional
//! additive jitter, bounded-wait shutdown. One `tokio::task` per registered
//! job, all cancelled from a shared `CancellationToken`.

mod jobs;

pub use jobs::{CleanupOrphanedImagesJob, RefreshImagesJob, RefreshTrigger, RescanDatabaseJob};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{Error, Result};

/// A unit of scheduled work. Implementors should treat `run` as
/// cancel-safe: the scheduler races it against its own timeout and drops
/// the future on the losing side.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct JobSchedule {
    pub interval: Duration,
    pub jitter: Duration,
    pub timeout: Duration,
    pub enabled: bool,
}

impl JobSchedule {
    pub fn every(interval: Duration) -> Self {
        JobSchedule {
            interval,
            jitter: Duration::ZERO,
            timeout: Duration::ZERO,
            enabled: true,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let extra = rand::thread_rng().gen_range(0..self.jitter.as_millis().max(1) as u64);
        self.interval + Duration::from_millis(extra)
    }
}

struct RegisteredJob {
    job: Arc<dyn Job>,
    schedule: JobSchedule,
    handle: Option<JoinHandle<()>>,
}

/// `Scheduler` owns no job logic itself; jobs are registered via `add_job`
/// and driven on independent tasks once `start` is called.
pub struct Scheduler {
    jobs: parking_lot::Mutex<HashMap<String, RegisteredJob>>,
    cancellation: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            jobs: parking_lot::Mutex::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Register a named job. Rejects duplicate names. Disabled jobs are
    /// recorded but never driven by `start`.
    pub fn add_job(&self, name: impl Into<String>, job: Arc<dyn Job>, schedule: JobSchedule) -> Result<()> {
        let name = name.into();
        let mut guard = self.jobs.lock();
        if guard.contains_key(&name) {
            return Err(Error::Invariant(format!("job {name} already registered")));
        }
        guard.insert(
            name,
            RegisteredJob {
                job,
                schedule,
                handle: None,
            },
        );
        Ok(())
    }

    /// Spawn a driving task per enabled job.
    pub fn start(self: &Arc<Self>) {
        let names: Vec<String> = self.jobs.lock().keys().cloned().collect();
        for name in names {
            let schedule = self.jobs.lock().get(&name).map(|j| j.schedule);
            let Some(schedule) = schedule else { continue };
            if !schedule.enabled {
                info!(job = %name, "job registered but disabled, not starting");
                continue;
            }
            let this = self.clone();
            let job_name = name.clone();
            let handle = tokio::spawn(async move { this.drive(job_name).await });
            if let Some(entry) = self.jobs.lock().get_mut(&name) {
                entry.handle = Some(handle);
            }
        }
    }

    async fn drive(self: Arc<Self>, name: String) {
        loop {
            let schedule = match self.jobs.lock().get(&name) {
                Some(j) => j.schedule,
                None => return,
            };
            let delay = schedule.next_delay();
            tokio::select! {
                _ = self.cancellation.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.cancellation.is_cancelled() {
                return;
            }
            self.run_named(&name).await;
        }
    }

    #[instrument(skip(self))]
    async fn run_named(&self, name: &str) {
        let entry = {
            let guard = self.jobs.lock();
            guard.get(name).map(|j| (j.job.clone(), j.schedule))
        };
        let Some((job, schedule)) = entry else {
            warn!(job = %name, "run requested for unknown job");
            return;
        };

        let result = if schedule.timeout.is_zero() {
            job.run().await
        } else {
            match tokio::time::timeout(schedule.timeout, job.run()).await {
                Ok(r) => r,
                Err(_) => Err(Error::Transient(format!("job {name} timed out"))),
            }
        };

        if let Err(e) = result {
            error!(job = %name, error = %e, "scheduled job failed");
        }
    }

    /// Trigger an out-of-band execution, obeying the job's configured
    /// timeout exactly as a regular tick would.
    pub async fn run_job_now(&self, name: &str) -> Result<()> {
        if !self.jobs.lock().contains_key(name) {
            return Err(Error::Invariant(format!("no such job: {name}")));
        }
        self.run_named(name).await;
        Ok(())
    }

    /// Cancel all driving tasks and wait up to 30s for them to exit.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.jobs.lock();
            guard.values_mut().filter_map(|j| j.handle.take()).collect()
        };
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
            warn!("scheduler stop: timed out waiting for jobs to drain");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob(Arc<AtomicUsize>);

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_job_names_are_rejected() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_job("dup", Arc::new(CountingJob(counter.clone())), JobSchedule::every(Duration::from_secs(60)))
            .unwrap();
        let err = scheduler
            .add_job("dup", Arc::new(CountingJob(counter)), JobSchedule::every(Duration::from_secs(60)))
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn run_job_now_obeys_timeout() {
        struct SlowJob;
        #[async_trait]
        impl Job for SlowJob {
            async fn run(&self) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }
        let scheduler = Scheduler::new();
        scheduler
            .add_job(
                "slow",
                Arc::new(SlowJob),
                JobSchedule::every(Duration::from_secs(3600)).with_timeout(Duration::from_millis(20)),
            )
            .unwrap();
        scheduler.run_job_now("slow").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_job_is_registered_but_never_driven() {
        let scheduler = Arc::new(Scheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_job(
                "disabled",
                Arc::new(CountingJob(counter.clone())),
                JobSchedule::every(Duration::from_millis(5)).disabled(),
            )
            .unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
