//! Ensures a metric point that disappears from the current snapshot keeps
//! being emitted as NaN (for downstream "absent" detection) until a
//! staleness window elapses, then drops it entirely. Last-seen timestamps
//! persist across restarts so the window survives a process bounce.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::store::PersistentStore;

/// One exported metric observation: a family name, its sorted label pairs,
/// and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub family: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl MetricPoint {
    /// Deterministic `family|k1=v1|k2=v2|...` key with labels sorted
    /// ascending by key.
    fn tracking_key(&self) -> String {
        let mut labels = self.labels.clone();
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        let mut key = self.family.clone();
        for (k, v) in labels {
            key.push('|');
            key.push_str(&k);
            key.push('=');
            key.push_str(&v);
        }
        key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackedPoint {
    family: String,
    labels: Vec<(String, String)>,
    last_seen: DateTime<Utc>,
}

pub struct MetricStalenessTracker {
    tracked: Mutex<HashMap<String, TrackedPoint>>,
    staleness_window: chrono::Duration,
    store: std::sync::Arc<dyn PersistentStore>,
    last_written: Mutex<Option<Vec<u8>>>,
}

impl MetricStalenessTracker {
    /// Loads any previously persisted last-seen state from the store.
    pub async fn load(store: std::sync::Arc<dyn PersistentStore>, staleness_window: Duration) -> Result<Self> {
        let blob = store.get_staleness_blob().await?;
        let tracked = match &blob {
            Some(bytes) => serde_json::from_slice(bytes).unwrap_or_default(),
            None => HashMap::new(),
        };
        Ok(MetricStalenessTracker {
            tracked: Mutex::new(tracked),
            staleness_window: chrono::Duration::from_std(staleness_window)
                .unwrap_or_else(|_| chrono::Duration::minutes(60)),
            store,
            last_written: Mutex::new(blob),
        })
    }

    /// Merge `current` against tracked state: update last-seen for present
    /// points, append NaN rows for points that just crossed the staleness
    /// window, and drop those from tracking. Returns the full point set to
    /// export this round.
    pub async fn update(&self, now: DateTime<Utc>, current: Vec<MetricPoint>) -> Result<Vec<MetricPoint>> {
        let mut output = current.clone();
        let mut changed = false;

        {
            let mut guard = self.tracked.lock();
            let mut seen_keys = HashSet::with_capacity(current.len());

            for point in &current {
                let key = point.tracking_key();
                seen_keys.insert(key.clone());
                let mut labels = point.labels.clone();
                labels.sort_by(|a, b| a.0.cmp(&b.0));
                guard.insert(
                    key,
                    TrackedPoint {
                        family: point.family.clone(),
                        labels,
                        last_seen: now,
                    },
                );
                changed = true;
            }

            let mut to_drop = Vec::new();
            for (key, tracked) in guard.iter() {
                if seen_keys.contains(key) {
                    continue;
                }
                if now - tracked.last_seen >= self.staleness_window {
                    output.push(MetricPoint {
                        family: tracked.family.clone(),
                        labels: tracked.labels.clone(),
                        value: f64::NAN,
                    });
                    to_drop.push(key.clone());
                }
            }
            for key in to_drop {
                guard.remove(&key);
                changed = true;
            }
        }

        if changed {
            self.persist_if_changed().await?;
        }
        Ok(output)
    }

    async fn persist_if_changed(&self) -> Result<()> {
        let snapshot = {
            let guard = self.tracked.lock();
            serde_json::to_vec(&*guard).map_err(|e| {
                crate::error::Error::Invariant(format!("failed to serialize staleness tracker: {e}"))
            })?
        };

        let should_write = {
            let last = self.last_written.lock();
            last.as_deref() != Some(snapshot.as_slice())
        };
        if should_write {
            self.store.set_staleness_blob(snapshot.clone()).await?;
            *self.last_written.lock() = Some(snapshot);
            debug!("metric staleness snapshot persisted");
        }
        Ok(())
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }
}
