//! One `Config` struct, nested per concern, loaded once at startup from
//! environment variables and passed by reference/clone into each
//! component's constructor (constructor injection throughout — no global
//! mutable config).

use std::path::PathBuf;
use std::time::Duration;

use crate::queue::FullBehavior;

const CONTAINERD_SOCKET_CANDIDATES: &[&str] = &[
    "/run/containerd/containerd.sock",
    "/run/k3s/containerd/containerd.sock",
    "/var/snap/microk8s/common/run/containerd.sock",
    "/run/dockershim.sock",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub namespace: Option<String>,
    pub containerd_socket: Option<String>,
    pub store_path: PathBuf,
    pub vulndb_dir: PathBuf,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub vulndb: VulnDbConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load from the process environment (`VULNWATCH_*`), falling back to
    /// defaults for anything unset. Never reads from disk or contacts a
    /// remote service.
    pub fn from_env() -> Self {
        Config {
            port: env_parsed("VULNWATCH_PORT").unwrap_or_else(default_port),
            namespace: env_string("VULNWATCH_NAMESPACE"),
            containerd_socket: env_string("VULNWATCH_CONTAINERD_SOCKET"),
            store_path: env_string("VULNWATCH_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_store_path),
            vulndb_dir: env_string("VULNWATCH_VULNDB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_vulndb_dir),
            queue: QueueConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            vulndb: VulnDbConfig::from_env(),
            api: ApiConfig::from_env(),
        }
    }

    /// First configured override, else the first candidate socket path
    /// that exists on disk.
    pub fn resolve_containerd_socket(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.containerd_socket {
            return Some(PathBuf::from(explicit));
        }
        CONTAINERD_SOCKET_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: default_port(),
            namespace: None,
            containerd_socket: None,
            store_path: default_store_path(),
            vulndb_dir: default_vulndb_dir(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            vulndb: VulnDbConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    env_parsed(key).unwrap_or(default)
}

fn env_seconds(key: &str, default: Duration) -> Duration {
    env_parsed::<u64>(key).map(Duration::from_secs).unwrap_or(default)
}

fn default_port() -> u16 {
    8080
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/vulnwatch/store.db")
}

fn default_vulndb_dir() -> PathBuf {
    PathBuf::from("/var/lib/vulnwatch/vulndb")
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_depth: usize,
    pub full_behavior: FullBehavior,
}

impl QueueConfig {
    fn from_env() -> Self {
        let full_behavior = match env_string("VULNWATCH_QUEUE_FULL_BEHAVIOR").as_deref() {
            Some("drop_oldest") => FullBehavior::DropOldest,
            Some("block") => FullBehavior::Block,
            _ => FullBehavior::Drop,
        };
        QueueConfig {
            max_depth: env_parsed("VULNWATCH_QUEUE_MAX_DEPTH").unwrap_or(0),
            full_behavior,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_depth: 0,
            full_behavior: FullBehavior::Drop,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub jitter: Duration,
}

impl JobConfig {
    fn from_env(prefix: &str, default_interval: Duration, default_jitter: Duration) -> Self {
        JobConfig {
            enabled: env_bool(&format!("{prefix}_ENABLED"), true),
            interval: env_seconds(&format!("{prefix}_INTERVAL_SECS"), default_interval),
            timeout: env_seconds(&format!("{prefix}_TIMEOUT_SECS"), Duration::ZERO),
            jitter: env_seconds(&format!("{prefix}_JITTER_SECS"), default_jitter),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub refresh_images: JobConfig,
    pub rescan_database: JobConfig,
    pub cleanup_orphaned_images: JobConfig,
}

impl SchedulerConfig {
    fn from_env() -> Self {
        SchedulerConfig {
            refresh_images: JobConfig::from_env(
                "VULNWATCH_JOB_REFRESH_IMAGES",
                Duration::from_secs(6 * 60 * 60),
                Duration::from_secs(30),
            ),
            rescan_database: JobConfig::from_env(
                "VULNWATCH_JOB_RESCAN_DATABASE",
                Duration::from_secs(60 * 60),
                Duration::from_secs(30),
            ),
            cleanup_orphaned_images: JobConfig::from_env(
                "VULNWATCH_JOB_CLEANUP_ORPHANED_IMAGES",
                Duration::from_secs(24 * 60 * 60),
                Duration::from_secs(60),
            ),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            refresh_images: JobConfig {
                enabled: true,
                interval: Duration::from_secs(6 * 60 * 60),
                timeout: Duration::ZERO,
                jitter: Duration::from_secs(30),
            },
            rescan_database: JobConfig {
                enabled: true,
                interval: Duration::from_secs(60 * 60),
                timeout: Duration::ZERO,
                jitter: Duration::from_secs(30),
            },
            cleanup_orphaned_images: JobConfig {
                enabled: true,
                interval: Duration::from_secs(24 * 60 * 60),
                timeout: Duration::ZERO,
                jitter: Duration::from_secs(60),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct VulnDbConfig {
    pub feed_url: String,
    pub feed_poll_interval: Duration,
}

impl VulnDbConfig {
    fn from_env() -> Self {
        VulnDbConfig {
            feed_url: env_string("VULNWATCH_VULNDB_FEED_URL").unwrap_or_else(default_feed_url),
            feed_poll_interval: env_seconds("VULNWATCH_VULNDB_FEED_POLL_INTERVAL_SECS", Duration::from_secs(2)),
        }
    }
}

impl Default for VulnDbConfig {
    fn default() -> Self {
        VulnDbConfig {
            feed_url: default_feed_url(),
            feed_poll_interval: Duration::from_secs(2),
        }
    }
}

fn default_feed_url() -> String {
    "https://vulnwatch.invalid/databases/v6/listing.json".into()
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub metric_staleness_window: Duration,
}

impl ApiConfig {
    fn from_env() -> Self {
        ApiConfig {
            metric_staleness_window: env_seconds(
                "VULNWATCH_METRIC_STALENESS_WINDOW_SECS",
                Duration::from_secs(60 * 60),
            ),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            metric_staleness_window: Duration::from_secs(60 * 60),
        }
    }
}
