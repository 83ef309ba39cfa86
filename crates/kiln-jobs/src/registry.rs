//! Handler registration.
//!
//! A [`JobRegistry`] maps each job kind to the handler that executes it. It is
//! filled once at startup and handed to the [`JobClient`](crate::JobClient),
//! which keeps it behind an `Arc` and never mutates it again.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobContext};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Executes the serialized payload of one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one attempt. Returning an error hands the job to the retry policy.
    async fn execute(&self, ctx: JobContext, payload: &str) -> JobResult<()>;

    /// Deadline override for this kind.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Retry policy override for this kind.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Typed worker for one [`Job`] type.
///
/// # Example
///
/// ```rust,ignore
/// struct DigestWorker;
///
/// #[async_trait]
/// impl Worker<Digest> for DigestWorker {
///     async fn work(&self, ctx: &JobContext, args: Digest) -> JobResult<()> {
///         build_digest(args.user_id).await.map_err(JobError::failed)
///     }
/// }
///
/// registry.register_worker(DigestWorker)?;
/// ```
#[async_trait]
pub trait Worker<J: Job>: Send + Sync + 'static {
    /// Runs one attempt with decoded arguments.
    async fn work(&self, ctx: &JobContext, args: J) -> JobResult<()>;

    /// Deadline override for this job type.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Retry policy override for this job type.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Adapts a [`Worker`] to the untyped [`JobHandler`] interface.
pub struct TypedHandler<J, W> {
    worker: W,
    _job: PhantomData<fn() -> J>,
}

impl<J: Job, W: Worker<J>> TypedHandler<J, W> {
    /// Wraps a typed worker.
    pub fn new(worker: W) -> Self {
        Self {
            worker,
            _job: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job, W: Worker<J>> JobHandler for TypedHandler<J, W> {
    async fn execute(&self, ctx: JobContext, payload: &str) -> JobResult<()> {
        let args: J = serde_json::from_str(payload)?;
        self.worker.work(&ctx, args).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.worker.timeout()
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.worker.retry_policy()
    }
}

/// A [`Worker`] backed by a closure. Built with [`handler_fn`].
pub struct FnWorker<J, F> {
    f: F,
    _job: PhantomData<fn() -> J>,
}

/// Turns an async closure into a [`Worker`].
///
/// ```rust,ignore
/// registry.register_worker(handler_fn(|_ctx, args: Digest| async move {
///     build_digest(args.user_id).await.map_err(JobError::failed)
/// }))?;
/// ```
pub fn handler_fn<J, F, Fut>(f: F) -> FnWorker<J, F>
where
    J: Job,
    F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<()>> + Send + 'static,
{
    FnWorker {
        f,
        _job: PhantomData,
    }
}

#[async_trait]
impl<J, F, Fut> Worker<J> for FnWorker<J, F>
where
    J: Job,
    F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<()>> + Send + 'static,
{
    async fn work(&self, ctx: &JobContext, args: J) -> JobResult<()> {
        (self.f)(ctx.clone(), args).await
    }
}

/// Kind-to-handler table.
#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, handler: impl JobHandler + 'static) -> JobResult<()> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(JobError::Validation("job kind must not be empty".to_string()));
        }
        if self.handlers.contains_key(&kind) {
            return Err(JobError::Conflict(format!("job kind '{}' is already registered", kind)));
        }

        info!(kind = %kind, "Registered job handler");
        self.handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    /// Registers a typed worker under its job's kind.
    pub fn register_worker<J: Job, W: Worker<J>>(&mut self, worker: W) -> JobResult<()> {
        self.register(J::KIND, TypedHandler::<J, W>::new(worker))
    }

    /// Returns the handler for `kind`.
    pub fn lookup(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Returns true if `kind` has a handler.
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobRecord, JobState};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: u64,
        b: u64,
    }

    impl Job for Add {
        const KIND: &'static str = "add";
    }

    struct AddWorker {
        total: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Worker<Add> for AddWorker {
        async fn work(&self, _ctx: &JobContext, args: Add) -> JobResult<()> {
            self.total.fetch_add(args.a + args.b, Ordering::SeqCst);
            Ok(())
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(5))
        }
    }

    fn context(kind: &str) -> JobContext {
        let now = Utc::now();
        let record = JobRecord {
            id: JobId::new(1),
            kind: kind.to_string(),
            queue: "default".to_string(),
            payload: String::new(),
            state: JobState::Running,
            priority: 0,
            attempt: 1,
            max_attempts: 3,
            last_error: None,
            scheduled_at: now,
            attempted_at: Some(now),
            created_at: now,
            finalized_at: None,
        };
        JobContext::new(&record, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_typed_worker_decodes_payload() {
        let total = Arc::new(AtomicU64::new(0));
        let mut registry = JobRegistry::new();
        registry
            .register_worker(AddWorker { total: total.clone() })
            .unwrap();

        let handler = registry.lookup("add").unwrap();
        assert_eq!(handler.timeout(), Some(Duration::from_secs(5)));
        assert!(handler.retry_policy().is_none());

        handler
            .execute(context("add"), r#"{"a":2,"b":3}"#)
            .await
            .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_retryable() {
        let mut registry = JobRegistry::new();
        registry
            .register_worker(handler_fn(|_ctx, _args: Add| async { Ok(()) }))
            .unwrap();

        let err = registry
            .lookup("add")
            .unwrap()
            .execute(context("add"), r#"{"a":"two"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Serialization(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_handler_fn_receives_context() {
        let mut registry = JobRegistry::new();
        registry
            .register_worker(handler_fn(|ctx: JobContext, args: Add| async move {
                if ctx.attempt == 1 && args.a == 1 {
                    Err(JobError::failed("first attempt fails"))
                } else {
                    Ok(())
                }
            }))
            .unwrap();

        let handler = registry.lookup("add").unwrap();
        let err = handler
            .execute(context("add"), r#"{"a":1,"b":0}"#)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_duplicate_kind_conflicts() {
        let mut registry = JobRegistry::new();
        registry
            .register_worker(handler_fn(|_ctx, _args: Add| async { Ok(()) }))
            .unwrap();

        let err = registry
            .register_worker(handler_fn(|_ctx, _args: Add| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_and_kinds() {
        let mut registry = JobRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.lookup("add").is_none());

        registry
            .register("zeta", TypedHandler::<Add, _>::new(handler_fn(|_ctx, _args: Add| async { Ok(()) })))
            .unwrap();
        registry
            .register_worker(handler_fn(|_ctx, _args: Add| async { Ok(()) }))
            .unwrap();

        assert!(registry.contains("add"));
        assert!(!registry.contains("missing"));
        assert_eq!(registry.kinds(), vec!["add", "zeta"]);
    }

    #[test]
    fn test_empty_kind_rejected() {
        let mut registry = JobRegistry::new();
        let err = registry
            .register(" ", TypedHandler::<Add, _>::new(handler_fn(|_ctx, _args: Add| async { Ok(()) })))
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }
}
