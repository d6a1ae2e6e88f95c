use crate::scheduler::Scheduler;
use clap::Parser;
use std::time::Duration;

/// Operator settings, from the command line or the environment
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Reconcile Valkey custom resources", long_about = None)]
pub struct Config {
    /// Namespace to watch, every namespace when unset
    #[arg(short, long, env = "WATCH_NAMESPACE", value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of instances reconciled in parallel
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 4)]
    pub workers: u16,

    /// Drift check interval of converged instances
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 15 * 60)]
    pub resync_seconds: u64,

    /// Follow-up interval while children are still settling
    #[arg(long, env = "REQUEUE_SECONDS", default_value_t = 10)]
    pub requeue_seconds: u64,

    /// First retry delay after a transient error
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Longest retry delay after transient errors
    #[arg(long, env = "BACKOFF_MAX_SECONDS", default_value_t = 5 * 60)]
    pub backoff_max_seconds: u64,

    /// Listen address of the metrics and health endpoints
    #[arg(short, long, env = "BIND_ADDRESS", default_value = "0.0.0.0:9000")]
    pub bind: String,

    /// Log as json lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            resync: Duration::from_secs(self.resync_seconds),
            requeue: Duration::from_secs(self.requeue_seconds),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_seconds).max(Duration::from_millis(self.backoff_base_ms)),
        }
    }
}
