//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use thumb_models::{FailureClass, SizeCatalog, DEFAULT_SIZES};

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Deadline for one job attempt
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Parent directory for per-job scratch dirs
    pub work_dir: PathBuf,
    /// How often the worker should scan for orphaned pending jobs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending job can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Configured size catalogue
    pub sizes: SizeCatalog,
    /// Timeout for each external tool invocation
    pub render_timeout: Duration,
    /// Class assigned to failures no rule recognises
    pub unknown_failure_class: FailureClass,
    /// Take a per-parent lease before creating placeholders
    pub parent_lease: bool,
    pub parent_lease_ttl: Duration,
    /// Prometheus exporter port
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let job_timeout = Duration::from_secs(300);
        Self {
            max_concurrent_jobs: 4,
            job_timeout,
            shutdown_timeout: Duration::from_secs(30),
            work_dir: PathBuf::from("/tmp/thumbnailer"),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300),
            sizes: SizeCatalog::default(),
            render_timeout: Duration::from_secs(120),
            unknown_failure_class: FailureClass::Retryable,
            parent_lease: true,
            parent_lease_ttl: job_timeout + Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

/// Pending-message sweeps need a non-zero tick.
pub(crate) const MIN_CLAIM_INTERVAL: Duration = Duration::from_secs(1);

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(name).unwrap_or(default))
}

impl WorkerConfig {
    /// Create config from environment variables.
    ///
    /// Fails on a malformed `THUMBNAIL_SIZES` list or an unknown
    /// `WORKER_UNKNOWN_FAILURE_CLASS`.
    pub fn from_env() -> WorkerResult<Self> {
        let sizes_raw = std::env::var("THUMBNAIL_SIZES")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SIZES.to_string());
        let sizes = SizeCatalog::parse(&sizes_raw)
            .map_err(|e| WorkerError::config_error(format!("THUMBNAIL_SIZES: {}", e)))?;

        let unknown_failure_class = match std::env::var("WORKER_UNKNOWN_FAILURE_CLASS") {
            Ok(raw) if !raw.trim().is_empty() => FailureClass::parse(&raw).ok_or_else(|| {
                WorkerError::config_error(format!("WORKER_UNKNOWN_FAILURE_CLASS: unknown class '{}'", raw))
            })?,
            _ => FailureClass::Retryable,
        };

        let job_timeout = env_secs("WORKER_JOB_TIMEOUT", 300);
        let lease_ttl_default = job_timeout.as_secs() + 60;

        Ok(Self {
            max_concurrent_jobs: env_parse::<usize>("WORKER_MAX_JOBS").unwrap_or(4).max(1),
            job_timeout,
            shutdown_timeout: env_secs("WORKER_SHUTDOWN_TIMEOUT", 30),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/thumbnailer")),
            claim_interval: env_secs("WORKER_CLAIM_INTERVAL_SECS", 30).max(MIN_CLAIM_INTERVAL),
            claim_min_idle: env_secs("WORKER_CLAIM_MIN_IDLE_SECS", 300),
            sizes,
            render_timeout: env_secs("WORKER_RENDER_TIMEOUT", 120),
            unknown_failure_class,
            parent_lease: env_parse("WORKER_PARENT_LEASE").unwrap_or(true),
            parent_lease_ttl: env_secs("WORKER_PARENT_LEASE_TTL_SECS", lease_ttl_default),
            metrics_port: env_parse("METRICS_PORT"),
        })
    }
}
