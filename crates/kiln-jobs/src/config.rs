//! Job queue configuration.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Configuration for the job queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Queues this process works, keyed by name.
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, QueueConfig>,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Default retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Stale job rescue configuration.
    #[serde(default)]
    pub rescue: RescueConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            rescue: RescueConfig::default(),
        }
    }
}

fn default_queues() -> BTreeMap<String, QueueConfig> {
    BTreeMap::from([(DEFAULT_QUEUE.to_string(), QueueConfig::default())])
}

impl JobsConfig {
    /// Adds a queue, replacing any queue of the same name.
    pub fn with_queue(mut self, name: impl Into<String>, concurrency: usize) -> Self {
        self.queues.insert(name.into(), QueueConfig { concurrency });
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> JobResult<()> {
        if self.queues.is_empty() {
            return Err(JobError::Configuration("at least one queue must be configured".to_string()));
        }
        for (name, queue) in &self.queues {
            if name.trim().is_empty() {
                return Err(JobError::Configuration("queue names must not be empty".to_string()));
            }
            if queue.concurrency == 0 {
                return Err(JobError::Configuration(format!(
                    "queue '{}' must have a concurrency of at least 1",
                    name
                )));
            }
        }
        if self.retry.max_attempts <= 0 {
            return Err(JobError::Configuration(format!(
                "retry.max_attempts must be positive, got {}",
                self.retry.max_attempts
            )));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(JobError::Configuration(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(JobError::Configuration("worker.poll_interval_ms must be positive".to_string()));
        }
        if self.rescue.stale_after() <= self.worker.job_timeout() {
            return Err(JobError::Configuration(format!(
                "rescue.stale_after_secs ({}) must exceed worker.job_timeout_secs ({})",
                self.rescue.stale_after_secs, self.worker.job_timeout_secs
            )));
        }
        Ok(())
    }

    /// Checks a handler's deadline override against the rescue threshold.
    ///
    /// An attempt allowed to run past `rescue.stale_after_secs` would be
    /// rescued and claimed again while still running.
    pub fn validate_handler_timeout(&self, kind: &str, timeout: Duration) -> JobResult<()> {
        if timeout >= self.rescue.stale_after() {
            return Err(JobError::Configuration(format!(
                "timeout of job kind '{}' ({:?}) must be shorter than rescue.stale_after_secs ({})",
                kind, timeout, self.rescue.stale_after_secs
            )));
        }
        Ok(())
    }
}

/// Per-queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum jobs of this queue running at once in this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Default job execution deadline in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound of the random delay added to each poll.
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter_ms: u64,

    /// Drain timeout used by the process entry point, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// First backoff after a failed poll, in milliseconds.
    #[serde(default = "default_store_error_backoff")]
    pub store_error_backoff_ms: u64,

    /// Backoff ceiling after repeated failed polls, in milliseconds.
    #[serde(default = "default_store_error_backoff_max")]
    pub store_error_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout(),
            poll_interval_ms: default_poll_interval(),
            poll_jitter_ms: default_poll_jitter(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            store_error_backoff_ms: default_store_error_backoff(),
            store_error_backoff_max_ms: default_store_error_backoff_max(),
        }
    }
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_poll_jitter() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_store_error_backoff() -> u64 {
    500
}

fn default_store_error_backoff_max() -> u64 {
    30_000
}

impl WorkerConfig {
    /// Returns job timeout as Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns poll jitter bound as Duration.
    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Backoff after `consecutive_errors` failed polls in a row.
    pub fn store_error_backoff(&self, consecutive_errors: u32) -> Duration {
        let exp = consecutive_errors.saturating_sub(1).min(16);
        let delay = self.store_error_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.store_error_backoff_max_ms))
    }
}

/// Default retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling for jobs enqueued without one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_max_attempts() -> i32 {
    25
}

fn default_initial_delay() -> u64 {
    1000 // 1 second
}

fn default_max_delay() -> u64 {
    3_600_000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

/// Stale job rescue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescueConfig {
    /// Interval between sweeps in seconds.
    #[serde(default = "default_rescue_interval")]
    pub interval_secs: u64,

    /// A running job older than this is considered abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rescue_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_rescue_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    3600
}

impl RescueConfig {
    /// Returns the sweep interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Returns the liveness threshold as Duration.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}
