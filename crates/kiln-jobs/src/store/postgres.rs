//! PostgreSQL job store.
//!
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//! dispatchers in any number of processes skip each other's rows instead of
//! blocking on them.

use super::{cancel_rejected, JobStore, QueueStats, ABANDONED_ERROR};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info, warn};

macro_rules! columns {
    () => {
        "id, kind, queue, payload, state, priority, attempt, max_attempts, last_error, \
         scheduled_at, attempted_at, created_at, finalized_at"
    };
}

/// Job store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Connects to the database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> JobResult<Self> {
        info!("Connecting to PostgreSQL job store...");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to connect to job store");
                JobError::Store(e)
            })?;

        info!("PostgreSQL job store connected");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn current_state(&self, id: JobId) -> JobResult<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM kiln_jobs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        state.map(|s| s.parse()).transpose()
    }
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> JobResult<()> {
        info!("Running job store migrations (postgres)...");
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("Job store migrations completed");
        Ok(())
    }

    async fn insert(&self, job: &NewJob) -> JobResult<JobId> {
        job.validate()?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO kiln_jobs (kind, queue, payload, state, priority, attempt, max_attempts, \
             scheduled_at, created_at) \
             VALUES ($1, $2, $3, 'available', $4, 0, $5, $6, $7) \
             RETURNING id",
        )
        .bind(&job.kind)
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.scheduled_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(JobId::new(id))
    }

    async fn claim_batch(&self, queue: &str, limit: usize) -> JobResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let promoted = sqlx::query(
            "UPDATE kiln_jobs SET state = 'available' \
             WHERE queue = $1 AND state = 'retryable' AND scheduled_at <= $2",
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
            "WITH due AS ( \
                 SELECT id FROM kiln_jobs \
                 WHERE queue = $1 AND state = 'available' AND scheduled_at <= $2 \
                 ORDER BY priority, scheduled_at, id \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE kiln_jobs SET state = 'running', attempt = kiln_jobs.attempt + 1, attempted_at = $2 \
             FROM due WHERE kiln_jobs.id = due.id \
             RETURNING ",
            "kiln_jobs.id, kiln_jobs.kind, kiln_jobs.queue, kiln_jobs.payload, kiln_jobs.state, \
             kiln_jobs.priority, kiln_jobs.attempt, kiln_jobs.max_attempts, kiln_jobs.last_error, \
             kiln_jobs.scheduled_at, kiln_jobs.attempted_at, kiln_jobs.created_at, kiln_jobs.finalized_at"
        ))
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
            "UPDATE kiln_jobs SET state = 'completed', finalized_at = $1 \
             WHERE id = $2 AND state = 'running'",
        )
        .bind(Utc::now())
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
            "UPDATE kiln_jobs SET state = 'retryable', scheduled_at = $1, last_error = $2 \
             WHERE id = $3 AND state = 'running'",
        )
        .bind(next_scheduled_at)
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
            "UPDATE kiln_jobs SET state = 'discarded', last_error = $1, finalized_at = $2 \
             WHERE id = $3 AND state = 'running'",
        )
        .bind(error)
        .bind(Utc::now())
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
            "UPDATE kiln_jobs SET state = 'cancelled', finalized_at = $1 \
             WHERE id = $2 AND state IN ('available', 'retryable')",
        )
        .bind(Utc::now())
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(cancel_rejected(id, self.current_state(id).await?));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> JobResult<Option<JobRecord>> {
        let row = sqlx::query(concat!("SELECT ", columns!(), " FROM kiln_jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn rescue_stale(&self, stale_before: DateTime<Utc>) -> JobResult<Vec<JobRecord>> {
        let now = Utc::now();
        let rows = sqlx::query(concat!(
            "UPDATE kiln_jobs SET \
                 state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'available' END, \
                 finalized_at = CASE WHEN attempt >= max_attempts THEN $1 ELSE NULL END, \
                 scheduled_at = CASE WHEN attempt >= max_attempts THEN scheduled_at ELSE $1 END, \
                 last_error = $2 \
             WHERE state = 'running' AND attempted_at < $3 \
             RETURNING ",
            columns!()
        ))
        .bind(now)
        .bind(ABANDONED_ERROR)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn queue_stats(&self, queue: &str) -> JobResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM kiln_jobs WHERE queue = $1 GROUP BY state")
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

fn record_from_row(row: &PgRow) -> JobResult<JobRecord> {
    let state: String = row.try_get("state")?;

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
        scheduled_at: row.try_get("scheduled_at")?,
        attempted_at: row.try_get("attempted_at")?,
        created_at: row.try_get("created_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}
