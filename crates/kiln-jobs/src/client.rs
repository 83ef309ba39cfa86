//! Client facade: enqueue, lifecycle and inspection.

use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobRecord, NewJob};
use crate::metrics::JobMetrics;
use crate::queue::EnqueueOptions;
use crate::registry::JobRegistry;
use crate::rescuer;
use crate::retry::RetryPolicy;
use crate::store::{JobStore, QueueStats};
use crate::worker::{Dispatcher, Executor};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Handle to the job queue.
///
/// Built once at startup and cloned into every collaborator that enqueues
/// work. Clones share the same store, registry and worker state.
#[derive(Clone)]
pub struct JobClient {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    config: JobsConfig,
    default_retry: RetryPolicy,
    wakeups: HashMap<String, Arc<Notify>>,
    runtime: Mutex<Option<Runtime>>,
}

/// Tasks owned by a started client.
struct Runtime {
    shutdown: CancellationToken,
    jobs_cancel: CancellationToken,
    tracker: TaskTracker,
    dispatchers: Vec<JoinHandle<()>>,
    rescuer: JoinHandle<()>,
}

impl JobClient {
    /// Creates a client. The registry is frozen from here on.
    ///
    /// Fails if the configuration is invalid or a handler's deadline is not
    /// shorter than the rescue threshold.
    pub fn new(store: Arc<dyn JobStore>, registry: JobRegistry, config: JobsConfig) -> JobResult<Self> {
        config.validate()?;
        for kind in registry.kinds() {
            if let Some(timeout) = registry.lookup(kind).and_then(|handler| handler.timeout()) {
                config.validate_handler_timeout(kind, timeout)?;
            }
        }

        let wakeups = config
            .queues
            .keys()
            .map(|queue| (queue.clone(), Arc::new(Notify::new())))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry: Arc::new(registry),
                default_retry: RetryPolicy::from(&config.retry),
                config,
                wakeups,
                runtime: Mutex::new(None),
            }),
        })
    }

    /// Enqueues a typed job.
    ///
    /// Options left unset fall back to the job type's constants, then to
    /// the client configuration.
    pub async fn enqueue<J: Job>(&self, args: &J, opts: EnqueueOptions) -> JobResult<JobId> {
        let payload = serde_json::to_string(args)
            .map_err(|e| JobError::Validation(format!("failed to serialize job arguments: {}", e)))?;
        self.enqueue_raw(J::KIND, payload, opts.with_job_defaults::<J>()).await
    }

    /// Enqueues an already serialized payload.
    ///
    /// `kind` must be registered with this client.
    pub async fn enqueue_raw(
        &self,
        kind: &str,
        payload: impl Into<String>,
        opts: EnqueueOptions,
    ) -> JobResult<JobId> {
        if kind.trim().is_empty() {
            return Err(JobError::Validation("job kind must not be empty".to_string()));
        }
        if !self.inner.registry.contains(kind) {
            return Err(JobError::Validation(format!("job kind '{}' is not registered", kind)));
        }

        let now = Utc::now();
        let job = NewJob {
            kind: kind.to_string(),
            queue: opts.queue_or(crate::config::DEFAULT_QUEUE).to_string(),
            payload: payload.into(),
            scheduled_at: opts.scheduled_at(now)?,
            max_attempts: opts.max_attempts_or(self.inner.config.retry.max_attempts),
            priority: opts.priority_or(0),
        };
        job.validate()?;

        let id = self.inner.store.insert(&job).await?;
        debug!(
            job_id = %id,
            kind = %job.kind,
            queue = %job.queue,
            scheduled_at = %job.scheduled_at,
            "Job enqueued"
        );
        JobMetrics::job_enqueued(&job.queue, &job.kind);

        if job.scheduled_at <= now {
            if let Some(wakeup) = self.inner.wakeups.get(&job.queue) {
                wakeup.notify_one();
            }
        }
        Ok(id)
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> JobResult<()> {
        self.inner.store.migrate().await
    }

    /// Migrates the store, then starts one dispatcher per configured queue
    /// and the stale job rescuer.
    pub async fn start(&self) -> JobResult<()> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Err(JobError::InvalidState {
                expected: "stopped".to_string(),
                actual: "running".to_string(),
            });
        }

        self.migrate().await?;

        let shutdown = CancellationToken::new();
        let jobs_cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let executor = Executor::new(
            Arc::clone(&self.inner.store),
            self.inner.config.worker.job_timeout(),
            self.inner.default_retry.clone(),
        );

        let dispatchers = self
            .inner
            .config
            .queues
            .iter()
            .map(|(queue, queue_config)| {
                let dispatcher = Dispatcher {
                    queue: queue.clone(),
                    concurrency: queue_config.concurrency,
                    store: Arc::clone(&self.inner.store),
                    registry: Arc::clone(&self.inner.registry),
                    executor: executor.clone(),
                    worker: self.inner.config.worker.clone(),
                    wakeup: self
                        .inner
                        .wakeups
                        .get(queue)
                        .cloned()
                        .unwrap_or_default(),
                    shutdown: shutdown.clone(),
                    jobs_cancel: jobs_cancel.clone(),
                    tracker: tracker.clone(),
                };
                tokio::spawn(dispatcher.run())
            })
            .collect();

        let rescuer = tokio::spawn(rescuer::run(
            Arc::clone(&self.inner.store),
            self.inner.config.rescue.clone(),
            shutdown.clone(),
        ));

        info!(
            backend = self.inner.store.backend(),
            queues = ?self.inner.config.queues.keys().collect::<Vec<_>>(),
            kinds = ?self.inner.registry.kinds(),
            "Job client started"
        );

        *runtime = Some(Runtime {
            shutdown,
            jobs_cancel,
            tracker,
            dispatchers,
            rescuer,
        });
        Ok(())
    }

    /// Stops claiming and waits up to `drain_timeout` for in-flight jobs.
    ///
    /// The budget covers both the dispatcher loops winding down and the
    /// in-flight jobs finishing. On timeout every in-flight job is asked to
    /// cancel and [`JobError::ShutdownTimeout`] is returned. Those jobs keep
    /// running in the background; any left `running` are picked up by the
    /// rescuer of a later process.
    pub async fn stop(&self, drain_timeout: Duration) -> JobResult<()> {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return Err(JobError::InvalidState {
                expected: "running".to_string(),
                actual: "stopped".to_string(),
            });
        };
        let Runtime {
            shutdown,
            jobs_cancel,
            tracker,
            dispatchers,
            rescuer,
        } = runtime;

        info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "Stopping job client...");
        shutdown.cancel();

        let drain = async {
            for handle in dispatchers {
                if let Err(e) = handle.await {
                    error!(error = %e, "Dispatcher task failed");
                }
            }
            if let Err(e) = rescuer.await {
                error!(error = %e, "Rescuer task failed");
            }
            tracker.close();
            tracker.wait().await;
        };

        if timeout(drain_timeout, drain).await.is_err() {
            tracker.close();
            let in_flight = tracker.len();
            jobs_cancel.cancel();
            warn!(in_flight, "Drain timed out, abandoning in-flight jobs");
            return Err(JobError::ShutdownTimeout {
                timeout: drain_timeout,
                in_flight,
            });
        }

        info!("Job client stopped");
        Ok(())
    }

    /// Returns true between `start` and `stop`.
    pub async fn is_running(&self) -> bool {
        self.inner.runtime.lock().await.is_some()
    }

    /// Cancels a job that has not started running.
    pub async fn cancel(&self, id: JobId) -> JobResult<()> {
        self.inner.store.cancel(id).await?;
        info!(job_id = %id, "Job cancelled");
        JobMetrics::job_cancelled();
        Ok(())
    }

    /// Fetches a job record.
    pub async fn job(&self, id: JobId) -> JobResult<Option<JobRecord>> {
        self.inner.store.get(id).await
    }

    /// Record counts per state for `queue`.
    pub async fn queue_stats(&self, queue: &str) -> JobResult<QueueStats> {
        self.inner.store.queue_stats(queue).await
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Returns the registry.
    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    /// Returns the configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient")
            .field("backend", &self.inner.store.backend())
            .field("registry", &self.inner.registry)
            .field("queues", &self.inner.config.queues)
            .finish()
    }
}
