//! Configuration types.
//!
//! Defaults cover local development; every knob can be overridden with a
//! `CLASSFETCH_*` environment variable (see [`Config::from_env`]).

use std::path::PathBuf;
use std::time::Duration;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Address the HTTP API binds to.
    pub listen_addr: String,
    /// Directory downloaded artifacts are written under.
    pub download_dir: PathBuf,
    /// Per-request timeout for the HTTP downloader.
    pub download_timeout: Duration,
    pub worker: WorkerConfig,
}

/// Worker engine and queue policy knobs.
///
/// `concurrency_limit` and `poll_interval` are the two levers governing
/// throughput vs. backpressure.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent downloads per engine instance.
    pub concurrency_limit: usize,
    /// Poll loop sleep when no work (or no slots) is available.
    pub poll_interval: Duration,
    /// Minimum time between heartbeat flushes for one job.
    pub heartbeat_interval: Duration,
    /// Flush early when progress advanced by this many percent-points.
    pub heartbeat_percent_delta: u8,
    /// Retry budget per job. `retry_count` exhausts against this.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Running jobs whose heartbeat is older than this are reclaimed.
    pub stale_after: Duration,
    /// How often the supervisor sweeps for stale jobs.
    pub reclaim_interval: Duration,
    /// How long shutdown waits for in-flight downloads before
    /// cooperatively cancelling them.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/classfetch.db"),
            listen_addr: "0.0.0.0:8001".to_string(),
            download_dir: PathBuf::from("./downloads"),
            download_timeout: Duration::from_secs(3600),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_percent_delta: 5,
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            stale_after: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Build a config from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: env_path("CLASSFETCH_DB_PATH", defaults.db_path),
            listen_addr: std::env::var("CLASSFETCH_LISTEN_ADDR")
                .unwrap_or(defaults.listen_addr),
            download_dir: env_path("CLASSFETCH_DOWNLOAD_DIR", defaults.download_dir),
            download_timeout: env_secs("CLASSFETCH_DOWNLOAD_TIMEOUT_SECS", defaults.download_timeout),
            worker: WorkerConfig {
                concurrency_limit: env_usize(
                    "CLASSFETCH_MAX_CONCURRENT_DOWNLOADS",
                    defaults.worker.concurrency_limit,
                ),
                poll_interval: env_secs(
                    "CLASSFETCH_POLL_INTERVAL_SECS",
                    defaults.worker.poll_interval,
                ),
                heartbeat_interval: env_secs(
                    "CLASSFETCH_HEARTBEAT_INTERVAL_SECS",
                    defaults.worker.heartbeat_interval,
                ),
                heartbeat_percent_delta: defaults.worker.heartbeat_percent_delta,
                max_retries: env_u32("CLASSFETCH_MAX_RETRIES", defaults.worker.max_retries),
                backoff_base: env_secs("CLASSFETCH_BACKOFF_BASE_SECS", defaults.worker.backoff_base),
                backoff_cap: env_secs("CLASSFETCH_BACKOFF_CAP_SECS", defaults.worker.backoff_cap),
                stale_after: env_secs("CLASSFETCH_STALE_AFTER_SECS", defaults.worker.stale_after),
                reclaim_interval: env_secs(
                    "CLASSFETCH_RECLAIM_INTERVAL_SECS",
                    defaults.worker.reclaim_interval,
                ),
                drain_timeout: env_secs(
                    "CLASSFETCH_DRAIN_TIMEOUT_SECS",
                    defaults.worker.drain_timeout,
                ),
            },
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.worker.concurrency_limit, 5);
        assert_eq!(c.worker.max_retries, 3);
        assert!(c.worker.backoff_base < c.worker.backoff_cap);
        assert!(c.worker.heartbeat_interval < c.worker.stale_after);
    }
}
