//! SQLite job store.
//!
//! Timestamps are stored as unix microseconds so they compare numerically.
//! A claim is a single `UPDATE ... RETURNING` statement; SQLite takes the
//! database write lock for the whole statement, so concurrent claimers
//! serialize on it (waiting up to the busy timeout) and never see the same
//! row as `available`.

use super::{cancel_rejected, JobStore, QueueStats, ABANDONED_ERROR};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

macro_rules! columns {
    () => {
        "id, kind, queue, payload, state, priority, attempt, max_attempts, last_error, \
         scheduled_at, attempted_at, created_at, finalized_at"
    };
}

/// Job store backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Opens (creating if needed) the database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> JobResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(url = %url, "SQLite job store opened");
        Ok(Self { pool })
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds exactly one connection that is never recycled, since
    /// every new connection would see a different empty database.
    pub async fn in_memory() -> JobResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn current_state(&self, id: JobId) -> JobResult<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM kiln_jobs WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        state.map(|s| s.parse()).transpose()
    }
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn migrate(&self) -> JobResult<()> {
        info!("Running job store migrations (sqlite)...");
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        info!("Job store migrations completed");
        Ok(())
    }

    async fn insert(&self, job: &NewJob) -> JobResult<JobId> {
        job.validate()?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO kiln_jobs (kind, queue, payload, state, priority, attempt, max_attempts, \
             scheduled_at, created_at) \
             VALUES (?, ?, ?, 'available', ?, 0, ?, ?, ?) \
             RETURNING id",
        )
        .bind(&job.kind)
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(to_micros(job.scheduled_at))
        .bind(to_micros(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        Ok(JobId::new(id))
    }

    async fn claim_batch(&self, queue: &str, limit: usize) -> JobResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = to_micros(Utc::now());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let promoted = sqlx::query(
            "UPDATE kiln_jobs SET state = 'available' \
             WHERE queue = ? AND state = 'retryable' AND scheduled_at <= ?",
        )
        .bind(queue)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if promoted > 0 {
            debug!(queue = %queue, promoted, "Promoted retryable jobs");
        }

        let rows = sqlx::query(concat!(
            "UPDATE kiln_jobs SET state = 'running', attempt = attempt + 1, attempted_at = ? \
             WHERE id IN ( \
                 SELECT id FROM kiln_jobs \
                 WHERE queue = ? AND state = 'available' AND scheduled_at <= ? \
                 ORDER BY priority, scheduled_at, id \
                 LIMIT ? \
             ) RETURNING ",
            columns!()
        ))
        .bind(now)
        .bind(queue)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<JobResult<Vec<_>>>()?;
        records.sort_by(|a, b| {
            (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id))
        });
        Ok(records)
    }

    async fn complete(&self, id: JobId) -> JobResult<()> {
        let result = sqlx::query(
            "UPDATE kiln_jobs SET state = 'completed', finalized_at = ? \
             WHERE id = ? AND state = 'running'",
        )
        .bind(to_micros(Utc::now()))
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    async fn retry(&self, id: JobId, next_scheduled_at: DateTime<Utc>, error: &str) -> JobResult<()> {
        let result = sqlx::query(
            "UPDATE kiln_jobs SET state = 'retryable', scheduled_at = ?, last_error = ? \
             WHERE id = ? AND state = 'running'",
        )
        .bind(to_micros(next_scheduled_at))
        .bind(error)
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    async fn discard(&self, id: JobId, error: &str) -> JobResult<()> {
        let result = sqlx::query(
            "UPDATE kiln_jobs SET state = 'discarded', last_error = ?, finalized_at = ? \
             WHERE id = ? AND state = 'running'",
        )
        .bind(error)
        .bind(to_micros(Utc::now()))
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> JobResult<()> {
        let result = sqlx::query(
            "UPDATE kiln_jobs SET state = 'cancelled', finalized_at = ? \
             WHERE id = ? AND state IN ('available', 'retryable')",
        )
        .bind(to_micros(Utc::now()))
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(cancel_rejected(id, self.current_state(id).await?));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> JobResult<Option<JobRecord>> {
        let row = sqlx::query(concat!("SELECT ", columns!(), " FROM kiln_jobs WHERE id = ?"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn rescue_stale(&self, stale_before: DateTime<Utc>) -> JobResult<Vec<JobRecord>> {
        let now = to_micros(Utc::now());
        let rows = sqlx::query(concat!(
            "UPDATE kiln_jobs SET \
                 state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'available' END, \
                 finalized_at = CASE WHEN attempt >= max_attempts THEN ? ELSE NULL END, \
                 scheduled_at = CASE WHEN attempt >= max_attempts THEN scheduled_at ELSE ? END, \
                 last_error = ? \
             WHERE state = 'running' AND attempted_at < ? \
             RETURNING ",
            columns!()
        ))
        .bind(now)
        .bind(now)
        .bind(ABANDONED_ERROR)
        .bind(to_micros(stale_before))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn queue_stats(&self, queue: &str) -> JobResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM kiln_jobs WHERE queue = ? GROUP BY state")
                .bind(queue)
                .fetch_all(&self.pool)
                .await?;
        QueueStats::from_counts(rows)
    }

    async fn health_check(&self) -> JobResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> JobResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| JobError::Internal(format!("timestamp out of range: {}", micros)))
}

fn record_from_row(row: &SqliteRow) -> JobResult<JobRecord> {
    let state: String = row.try_get("state")?;
    let attempted_at: Option<i64> = row.try_get("attempted_at")?;
    let finalized_at: Option<i64> = row.try_get("finalized_at")?;

    Ok(JobRecord {
        id: JobId::new(row.try_get("id")?),
        kind: row.try_get("kind")?,
        queue: row.try_get("queue")?,
        payload: row.try_get("payload")?,
        state: state.parse()?,
        priority: row.try_get("priority")?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        scheduled_at: from_micros(row.try_get("scheduled_at")?)?,
        attempted_at: attempted_at.map(from_micros).transpose()?,
        created_at: from_micros(row.try_get("created_at")?)?,
        finalized_at: finalized_at.map(from_micros).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn store() -> SqliteJobStore {
        let store = SqliteJobStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn new_job(kind: &str, priority: i16) -> NewJob {
        NewJob {
            kind: kind.to_string(),
            queue: "default".to_string(),
            payload: "{}".to_string(),
            scheduled_at: Utc::now() - ChronoDuration::seconds(1),
            max_attempts: 3,
            priority,
        }
    }

    #[test]
    fn test_micros_round_trip() {
        let now = Utc::now();
        let back = from_micros(to_micros(now)).unwrap();
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.unwrap();
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = store().await;
        let id = store.insert(&new_job("report", 0)).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.kind, "report");
        assert_eq!(record.state, JobState::Available);
        assert_eq!(record.attempt, 0);
        assert!(record.attempted_at.is_none());
        assert!(store.get(JobId::new(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_job() {
        let store = store().await;
        let mut job = new_job("", 0);
        assert!(matches!(store.insert(&job).await, Err(JobError::Validation(_))));

        job.kind = "report".to_string();
        job.max_attempts = 0;
        assert!(matches!(store.insert(&job).await, Err(JobError::Validation(_))));
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_other_queues() {
        let store = store().await;
        let mut future = new_job("later", 0);
        future.scheduled_at = Utc::now() + ChronoDuration::hours(1);
        store.insert(&future).await.unwrap();

        let mut other = new_job("elsewhere", 0);
        other.queue = "mailers".to_string();
        store.insert(&other).await.unwrap();

        assert!(store.claim_batch("default", 10).await.unwrap().is_empty());
        assert_eq!(store.claim_batch("mailers", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_with_zero_limit() {
        let store = store().await;
        store.insert(&new_job("report", 0)).await.unwrap();
        assert!(store.claim_batch("default", 0).await.unwrap().is_empty());
    }
}
