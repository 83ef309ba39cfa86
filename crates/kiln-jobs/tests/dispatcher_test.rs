//! Dispatcher behavior when the store misbehaves.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{fast_config, memory_store, wait_for_state};
use kiln_jobs::{
    handler_fn, EnqueueOptions, Job, JobClient, JobError, JobId, JobRecord, JobRegistry,
    JobResult, JobState, JobStore, NewJob, QueueStats, SqliteJobStore,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize, Deserialize)]
struct Ping;

impl Job for Ping {
    const KIND: &'static str = "ping";
}

/// SQLite store whose claims fail or stall on demand.
struct FaultyStore {
    inner: Arc<SqliteJobStore>,
    failing_claims: AtomicUsize,
    claim_delay: Duration,
    claims: Mutex<Vec<Instant>>,
}

impl FaultyStore {
    async fn new(failing_claims: usize, claim_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: memory_store().await,
            failing_claims: AtomicUsize::new(failing_claims),
            claim_delay,
            claims: Mutex::new(Vec::new()),
        })
    }

    fn claim_times(&self) -> Vec<Instant> {
        self.claims.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStore for FaultyStore {
    fn backend(&self) -> &'static str {
        "faulty"
    }

    async fn migrate(&self) -> JobResult<()> {
        self.inner.migrate().await
    }

    async fn insert(&self, job: &NewJob) -> JobResult<JobId> {
        self.inner.insert(job).await
    }

    async fn claim_batch(&self, queue: &str, limit: usize) -> JobResult<Vec<JobRecord>> {
        self.claims.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.claim_delay).await;

        let fail = self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(JobError::Internal("database is unreachable".to_string()));
        }
        self.inner.claim_batch(queue, limit).await
    }

    async fn complete(&self, id: JobId) -> JobResult<()> {
        self.inner.complete(id).await
    }

    async fn retry(&self, id: JobId, next_scheduled_at: DateTime<Utc>, error: &str) -> JobResult<()> {
        self.inner.retry(id, next_scheduled_at, error).await
    }

    async fn discard(&self, id: JobId, error: &str) -> JobResult<()> {
        self.inner.discard(id, error).await
    }

    async fn cancel(&self, id: JobId) -> JobResult<()> {
        self.inner.cancel(id).await
    }

    async fn get(&self, id: JobId) -> JobResult<Option<JobRecord>> {
        self.inner.get(id).await
    }

    async fn rescue_stale(&self, stale_before: DateTime<Utc>) -> JobResult<Vec<JobRecord>> {
        self.inner.rescue_stale(stale_before).await
    }

    async fn queue_stats(&self, queue: &str) -> JobResult<QueueStats> {
        self.inner.queue_stats(queue).await
    }

    async fn health_check(&self) -> JobResult<()> {
        self.inner.health_check().await
    }
}

fn ping_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register_worker(handler_fn(|_ctx, _args: Ping| async { Ok(()) }))
        .unwrap();
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_claim_failures_back_off_and_dispatcher_recovers() {
    let store = FaultyStore::new(2, Duration::ZERO).await;
    let mut config = fast_config(1);
    config.worker.store_error_backoff_ms = 100;
    config.worker.store_error_backoff_max_ms = 400;

    let client = JobClient::new(store.clone(), ping_registry(), config).unwrap();
    client.migrate().await.unwrap();
    let id = client.enqueue(&Ping, EnqueueOptions::new()).await.unwrap();
    client.start().await.unwrap();

    wait_for_state(&client, id, JobState::Completed, Duration::from_secs(5)).await;
    client.stop(Duration::from_secs(1)).await.unwrap();

    let claims = store.claim_times();
    assert!(claims.len() >= 3, "expected a claim after two failures, got {}", claims.len());
    // Backoff doubles after each consecutive failure.
    assert!(claims[1] - claims[0] >= Duration::from_millis(100));
    assert!(claims[2] - claims[1] >= Duration::from_millis(200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_budget_covers_stalled_claim() {
    let store = FaultyStore::new(0, Duration::from_secs(5)).await;
    let client = JobClient::new(store.clone(), ping_registry(), fast_config(1)).unwrap();
    client.start().await.unwrap();

    // Let the dispatcher enter its slow claim.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!store.claim_times().is_empty());

    let began = Instant::now();
    let err = client.stop(Duration::from_millis(200)).await.unwrap_err();
    assert!(began.elapsed() < Duration::from_secs(2), "stop took {:?}", began.elapsed());
    assert!(matches!(err, JobError::ShutdownTimeout { in_flight: 0, .. }));
    assert!(!client.is_running().await);
}
