//! Dispatch loops and job execution.
//!
//! Each configured queue gets one [`Dispatcher`] with its own semaphore of
//! execution slots. The dispatcher only claims as many records as it has free
//! slots, so a queue never runs more jobs than its concurrency allows.

use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::job::{JobContext, JobRecord};
use crate::metrics::{JobMetrics, SlotMetrics};
use crate::registry::{JobHandler, JobRegistry};
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Error recorded on claimed records whose kind has no handler.
pub const UNKNOWN_KIND_ERROR: &str = "unknown kind";

/// Runs single attempts and records their outcome.
#[derive(Clone)]
pub(crate) struct Executor {
    store: Arc<dyn JobStore>,
    default_timeout: Duration,
    default_retry: RetryPolicy,
}

impl Executor {
    pub(crate) fn new(store: Arc<dyn JobStore>, default_timeout: Duration, default_retry: RetryPolicy) -> Self {
        Self {
            store,
            default_timeout,
            default_retry,
        }
    }

    /// Runs one attempt of a claimed record.
    ///
    /// Panics and deadline overruns are turned into errors, so the outcome
    /// always reaches the store.
    pub(crate) async fn run(&self, record: JobRecord, handler: Arc<dyn JobHandler>, cancel: CancellationToken) {
        let wait = (Utc::now() - record.scheduled_at).to_std().unwrap_or_default();
        JobMetrics::job_wait_time(&record.queue, &record.kind, wait);

        let deadline = handler.timeout().unwrap_or(self.default_timeout);
        let ctx = JobContext::new(&record, cancel.clone());
        let started = Instant::now();

        debug!("Executing job");
        let execution = AssertUnwindSafe(handler.execute(ctx, &record.payload)).catch_unwind();
        let outcome = match timeout(deadline, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                JobMetrics::job_panicked(&record.queue, &record.kind);
                Err(JobError::Panicked(panic_message(panic.as_ref())))
            }
            Err(_) => {
                cancel.cancel();
                JobMetrics::job_timed_out(&record.queue, &record.kind);
                Err(JobError::Timeout(deadline))
            }
        };

        self.finish(&record, handler.as_ref(), outcome, started.elapsed()).await;
    }

    async fn finish(
        &self,
        record: &JobRecord,
        handler: &dyn JobHandler,
        outcome: Result<(), JobError>,
        elapsed: Duration,
    ) {
        let err = match outcome {
            Ok(()) => {
                match self.store.complete(record.id).await {
                    Ok(()) => {
                        info!(elapsed_ms = elapsed.as_millis() as u64, "Job completed");
                        JobMetrics::job_completed(&record.queue, &record.kind, elapsed);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to mark job as completed");
                        JobMetrics::store_error("complete");
                    }
                }
                return;
            }
            Err(err) => err,
        };

        let message = err.to_string();
        if !err.is_retryable() || record.is_exhausted() {
            match self.store.discard(record.id, &message).await {
                Ok(()) => {
                    warn!(
                        error = %message,
                        max_attempts = record.max_attempts,
                        "Job failed permanently, discarded"
                    );
                    JobMetrics::job_discarded(&record.queue, &record.kind, err.kind_label());
                }
                Err(e) => {
                    error!(error = %e, job_error = %message, "Failed to mark job as discarded");
                    JobMetrics::store_error("discard");
                }
            }
            return;
        }

        let policy = handler.retry_policy().unwrap_or_else(|| self.default_retry.clone());
        let next_attempt_at = policy.next_attempt_at(record.attempt, Utc::now());
        match self.store.retry(record.id, next_attempt_at, &message).await {
            Ok(()) => {
                warn!(
                    error = %message,
                    next_attempt_at = %next_attempt_at,
                    "Job failed, retry scheduled"
                );
                JobMetrics::job_retried(&record.queue, &record.kind, err.kind_label(), elapsed);
            }
            Err(e) => {
                error!(error = %e, job_error = %message, "Failed to schedule job retry");
                JobMetrics::store_error("retry");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Fetch loop for one queue.
pub(crate) struct Dispatcher {
    pub(crate) queue: String,
    pub(crate) concurrency: usize,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) executor: Executor,
    pub(crate) worker: WorkerConfig,
    pub(crate) wakeup: Arc<Notify>,
    /// Stops claiming.
    pub(crate) shutdown: CancellationToken,
    /// Parent of every in-flight job's cancellation signal.
    pub(crate) jobs_cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl Dispatcher {
    /// Claims and dispatches until `shutdown` fires.
    pub(crate) async fn run(self) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let poll_interval = self.worker.poll_interval();
        let mut consecutive_errors: u32 = 0;

        info!(queue = %self.queue, concurrency = self.concurrency, "Dispatcher started");
        SlotMetrics::update(&self.queue, 0, self.concurrency);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let available = slots.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    permit = slots.acquire() => drop(permit),
                    _ = sleep(poll_interval) => {}
                }
                continue;
            }

            match self.store.claim_batch(&self.queue, available).await {
                Ok(records) => {
                    consecutive_errors = 0;
                    let claimed = records.len();
                    if claimed > 0 {
                        debug!(queue = %self.queue, claimed, "Claimed jobs");
                        JobMetrics::jobs_claimed(&self.queue, claimed);
                    }
                    for record in records {
                        self.dispatch(record, &slots).await;
                    }
                    if claimed == available {
                        // Full batch: more work is likely waiting.
                        continue;
                    }
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = self.worker.store_error_backoff(consecutive_errors);
                    error!(
                        queue = %self.queue,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to claim jobs"
                    );
                    JobMetrics::store_error("claim");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                    continue;
                }
            }

            let delay = poll_interval + self.jitter();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = sleep(delay) => {}
            }
        }

        info!(queue = %self.queue, "Dispatcher stopped");
    }

    async fn dispatch(&self, record: JobRecord, slots: &Arc<Semaphore>) {
        let Some(handler) = self.registry.lookup(&record.kind) else {
            let err = JobError::UnknownKind(record.kind.clone());
            warn!(
                job_id = %record.id,
                queue = %record.queue,
                error = %err,
                "No handler registered for job kind, discarding"
            );
            JobMetrics::unknown_kind(&record.queue, &record.kind);
            match self.store.discard(record.id, UNKNOWN_KIND_ERROR).await {
                Ok(()) => JobMetrics::job_discarded(&record.queue, &record.kind, err.kind_label()),
                Err(e) => {
                    error!(job_id = %record.id, error = %e, "Failed to discard job of unknown kind");
                    JobMetrics::store_error("discard");
                }
            }
            return;
        };

        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(job_id = %record.id, error = %e, "Execution slots closed, leaving job for rescue");
                return;
            }
        };

        let span = info_span!(
            "job",
            job_id = %record.id,
            kind = %record.kind,
            queue = %record.queue,
            attempt = record.attempt
        );
        let executor = self.executor.clone();
        let cancel = self.jobs_cancel.child_token();
        let task_slots = Arc::clone(slots);
        let queue = self.queue.clone();
        let concurrency = self.concurrency;

        self.tracker.spawn(
            async move {
                executor.run(record, handler, cancel).await;
                drop(permit);
                SlotMetrics::update(&queue, concurrency - task_slots.available_permits(), concurrency);
            }
            .instrument(span),
        );
        SlotMetrics::update(&self.queue, concurrency - slots.available_permits(), concurrency);
    }

    fn jitter(&self) -> Duration {
        let max = self.worker.poll_jitter();
        if max.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(boxed.as_ref()), "owned boom");

        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }
}
