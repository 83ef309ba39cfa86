//! Durable job record storage.
//!
//! Every state transition goes through a [`JobStore`]. The store is the only
//! source of truth: workers never cache job state across a claim.

mod postgres;
mod sqlite;

pub use postgres::PostgresJobStore;
pub use sqlite::SqliteJobStore;

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Error recorded on records the rescuer takes back from a dead worker.
pub const ABANDONED_ERROR: &str = "job abandoned while running";

/// Persistence contract for job records.
///
/// `complete`, `retry` and `discard` only apply to records in the `running`
/// state and fail with [`JobError::NotFound`] otherwise, so a record is never
/// finalized twice.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Creates or upgrades the schema. Safe to call on every start.
    async fn migrate(&self) -> JobResult<()>;

    /// Inserts an `available` record and returns its id.
    async fn insert(&self, job: &NewJob) -> JobResult<JobId>;

    /// Atomically moves up to `limit` due records of `queue` to `running`.
    ///
    /// Due `retryable` records are made `available` first. Records come back
    /// ordered by `(priority, scheduled_at, id)` with `attempt` already
    /// counting the attempt about to start. No record is returned to two
    /// callers.
    async fn claim_batch(&self, queue: &str, limit: usize) -> JobResult<Vec<JobRecord>>;

    /// Marks a running record `completed`.
    async fn complete(&self, id: JobId) -> JobResult<()>;

    /// Marks a running record `retryable`, eligible again at `next_scheduled_at`.
    async fn retry(&self, id: JobId, next_scheduled_at: DateTime<Utc>, error: &str) -> JobResult<()>;

    /// Marks a running record `discarded`.
    async fn discard(&self, id: JobId, error: &str) -> JobResult<()>;

    /// Marks an `available` or `retryable` record `cancelled`.
    async fn cancel(&self, id: JobId) -> JobResult<()>;

    /// Fetches a record.
    async fn get(&self, id: JobId) -> JobResult<Option<JobRecord>>;

    /// Returns running records whose attempt began before `stale_before` to
    /// `available`, or to `discarded` when no attempts remain.
    async fn rescue_stale(&self, stale_before: DateTime<Utc>) -> JobResult<Vec<JobRecord>>;

    /// Record counts per state for one queue.
    async fn queue_stats(&self, queue: &str) -> JobResult<QueueStats>;

    /// Checks that the store answers.
    async fn health_check(&self) -> JobResult<()>;
}

/// Record counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub available: u64,
    pub running: u64,
    pub completed: u64,
    pub retryable: u64,
    pub discarded: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Builds stats from `(state, count)` rows.
    pub fn from_counts<I>(rows: I) -> JobResult<Self>
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let mut stats = Self::default();
        for (state, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match state.parse::<JobState>()? {
                JobState::Available => stats.available = count,
                JobState::Running => stats.running = count,
                JobState::Completed => stats.completed = count,
                JobState::Retryable => stats.retryable = count,
                JobState::Discarded => stats.discarded = count,
                JobState::Cancelled => stats.cancelled = count,
            }
        }
        Ok(stats)
    }

    /// Count for one state.
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Available => self.available,
            JobState::Running => self.running,
            JobState::Completed => self.completed,
            JobState::Retryable => self.retryable,
            JobState::Discarded => self.discarded,
            JobState::Cancelled => self.cancelled,
        }
    }

    /// Records not yet terminal.
    pub fn pending(&self) -> u64 {
        self.available + self.running + self.retryable
    }

    /// All records of the queue.
    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|state| self.count(*state)).sum()
    }
}

/// Opens a store for a `sqlite:` or `postgres:` URL.
pub async fn connect(url: &str, max_connections: u32) -> JobResult<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = if url.starts_with("sqlite:") {
        Arc::new(SqliteJobStore::connect(url, max_connections).await?)
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        Arc::new(PostgresJobStore::connect(url, max_connections).await?)
    } else {
        return Err(JobError::Configuration(format!(
            "unsupported job store URL scheme: {}",
            url.split(':').next().unwrap_or_default()
        )));
    };

    info!(backend = store.backend(), "Job store connected");
    Ok(store)
}

/// Error for a cancel that matched no cancellable record.
pub(crate) fn cancel_rejected(id: JobId, actual: Option<JobState>) -> JobError {
    match actual {
        None => JobError::NotFound(id),
        Some(state) => JobError::InvalidState {
            expected: "available or retryable".to_string(),
            actual: state.to_string(),
        },
    }
}
