//! Shared fixtures for job queue integration tests.

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use kiln_jobs::{
    JobClient, JobId, JobRecord, JobRegistry, JobState, JobStore, JobsConfig, NewJob, QueueConfig,
    SqliteJobStore,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Opens a migrated in-memory store.
pub async fn memory_store() -> Arc<SqliteJobStore> {
    let store = SqliteJobStore::in_memory()
        .await
        .expect("Failed to open in-memory store");
    store.migrate().await.expect("Failed to run migrations");
    Arc::new(store)
}

/// Opens a migrated store in a fresh temp directory.
///
/// The directory must outlive the store.
pub async fn file_store(max_connections: u32) -> (TempDir, Arc<SqliteJobStore>) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let store = SqliteJobStore::connect(&url, max_connections)
        .await
        .expect("Failed to open file store");
    store.migrate().await.expect("Failed to run migrations");
    (dir, Arc::new(store))
}

/// An immediately due job in the default queue.
pub fn new_job(kind: &str, priority: i16) -> NewJob {
    NewJob {
        kind: kind.to_string(),
        queue: "default".to_string(),
        payload: "{}".to_string(),
        scheduled_at: Utc::now() - ChronoDuration::seconds(1),
        max_attempts: 3,
        priority,
    }
}

/// Configuration with short poll and retry delays.
pub fn fast_config(concurrency: usize) -> JobsConfig {
    let mut config = JobsConfig::default();
    config.queues = BTreeMap::from([("default".to_string(), QueueConfig { concurrency })]);
    config.worker.poll_interval_ms = 20;
    config.worker.poll_jitter_ms = 5;
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.retry.jitter_factor = 0.0;
    config
}

/// Builds a client over an in-memory store.
pub async fn memory_client(registry: JobRegistry, config: JobsConfig) -> JobClient {
    let store: Arc<dyn JobStore> = memory_store().await;
    JobClient::new(store, registry, config).expect("Failed to build client")
}

/// Polls `check` until it returns true or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits for a job to reach `state` and returns its record.
pub async fn wait_for_state(client: &JobClient, id: JobId, state: JobState, limit: Duration) -> JobRecord {
    eventually(limit, || async move {
        client
            .job(id)
            .await
            .expect("Failed to load job")
            .is_some_and(|record| record.state == state)
    })
    .await;

    client
        .job(id)
        .await
        .expect("Failed to load job")
        .expect("Job not found")
}
