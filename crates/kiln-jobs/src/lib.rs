//! Kiln Jobs - Durable Background Job Queue
//!
//! A database-backed job queue with:
//! - Typed job arguments with serde serialization
//! - Per-queue concurrency limits
//! - At-least-once execution with exponential backoff retries
//! - Exclusive claims (`UPDATE ... RETURNING` on SQLite, `SKIP LOCKED` on PostgreSQL)
//! - Graceful drain on shutdown and rescue of abandoned jobs
//!
//! # Architecture
//!
//! ```text
//!   enqueue ──► JobStore (available)
//!                  │
//!                  ▼ claim_batch (per queue, up to free slots)
//!              Dispatcher ──► unknown kind ──► discarded
//!                  │
//!                  ▼ one slot per job
//!              Executor ──► JobHandler::execute
//!                  │
//!        ┌─────────┼──────────────┐
//!        ▼         ▼              ▼
//!    completed  retryable     discarded
//!               (backoff)   (exhausted / fatal)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//!     subject: String,
//! }
//!
//! impl Job for SendEmail {
//!     const KIND: &'static str = "send_email";
//! }
//!
//! let mut registry = JobRegistry::new();
//! registry.register_worker(handler_fn(|_ctx, args: SendEmail| async move {
//!     println!("sending to {}", args.to);
//!     Ok(())
//! }))?;
//!
//! let store = SqliteJobStore::connect("sqlite://jobs.db", 4).await?;
//! let client = JobClient::new(Arc::new(store), registry, JobsConfig::default())?;
//! client.start().await?;
//!
//! client
//!     .enqueue(&SendEmail { to: "a@example.com".into(), subject: "Hi".into() }, EnqueueOptions::new())
//!     .await?;
//!
//! client.stop(Duration::from_secs(30)).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod rescuer;
pub mod retry;
pub mod store;
mod worker;

pub use client::JobClient;
pub use config::{JobsConfig, QueueConfig, RescueConfig, RetryConfig, WorkerConfig, DEFAULT_QUEUE};
pub use error::{JobError, JobResult};
pub use job::{Job, JobContext, JobId, JobRecord, JobState, NewJob};
pub use metrics::{register_metrics, JobMetrics, SlotMetrics};
pub use queue::{EnqueueOptions, Priority};
pub use registry::{handler_fn, FnWorker, JobHandler, JobRegistry, TypedHandler, Worker};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::{JobStore, PostgresJobStore, QueueStats, SqliteJobStore};
pub use worker::UNKNOWN_KIND_ERROR;

/// Common imports for defining and enqueuing jobs.
pub mod prelude {
    pub use crate::client::JobClient;
    pub use crate::config::JobsConfig;
    pub use crate::error::{JobError, JobResult};
    pub use crate::job::{Job, JobContext, JobId, JobState};
    pub use crate::queue::{EnqueueOptions, Priority};
    pub use crate::registry::{handler_fn, JobRegistry, Worker};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{JobStore, SqliteJobStore};
    pub use async_trait::async_trait;
}
