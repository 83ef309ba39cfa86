//! Job queue metrics.
//!
//! Recorded through the `metrics` facade; the process installs whatever
//! recorder it exports with.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job queue system.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "kiln_jobs_enqueued_total";
    /// Total jobs claimed for execution.
    pub const JOBS_CLAIMED_TOTAL: &str = "kiln_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "kiln_jobs_completed_total";
    /// Total failed attempts scheduled for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "kiln_jobs_retried_total";
    /// Total jobs discarded.
    pub const JOBS_DISCARDED_TOTAL: &str = "kiln_jobs_discarded_total";
    /// Total jobs cancelled.
    pub const JOBS_CANCELLED_TOTAL: &str = "kiln_jobs_cancelled_total";
    /// Total attempts that exceeded their deadline.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "kiln_jobs_timed_out_total";
    /// Total attempts that panicked.
    pub const JOBS_PANICKED_TOTAL: &str = "kiln_jobs_panicked_total";
    /// Total claimed records with no registered handler.
    pub const JOBS_UNKNOWN_KIND_TOTAL: &str = "kiln_jobs_unknown_kind_total";
    /// Total stale records taken back by the rescuer.
    pub const JOBS_RESCUED_TOTAL: &str = "kiln_jobs_rescued_total";
    /// Total failed store operations.
    pub const STORE_ERRORS_TOTAL: &str = "kiln_jobs_store_errors_total";

    /// Execution slots in use.
    pub const SLOTS_IN_USE: &str = "kiln_jobs_slots_in_use";
    /// Configured execution slots.
    pub const SLOTS_CONFIGURED: &str = "kiln_jobs_slots_configured";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "kiln_jobs_duration_seconds";
    /// Time between eligibility and start, in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "kiln_jobs_wait_time_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_CLAIMED_TOTAL,
        "Total number of jobs claimed for execution"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed attempts scheduled for retry"
    );
    describe_counter!(names::JOBS_DISCARDED_TOTAL, "Total number of jobs discarded");
    describe_counter!(names::JOBS_CANCELLED_TOTAL, "Total number of jobs cancelled");
    describe_counter!(
        names::JOBS_TIMED_OUT_TOTAL,
        "Total number of attempts that timed out"
    );
    describe_counter!(
        names::JOBS_PANICKED_TOTAL,
        "Total number of attempts that panicked"
    );
    describe_counter!(
        names::JOBS_UNKNOWN_KIND_TOTAL,
        "Total number of claimed jobs with no registered handler"
    );
    describe_counter!(
        names::JOBS_RESCUED_TOTAL,
        "Total number of stale running jobs rescued"
    );
    describe_counter!(
        names::STORE_ERRORS_TOTAL,
        "Total number of failed job store operations"
    );

    describe_gauge!(names::SLOTS_IN_USE, "Execution slots currently in use");
    describe_gauge!(names::SLOTS_CONFIGURED, "Configured execution slots");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Time from eligibility to start in seconds"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, kind: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record a batch of claimed jobs.
    pub fn jobs_claimed(queue: &str, count: usize) {
        counter!(names::JOBS_CLAIMED_TOTAL, "queue" => queue.to_string()).increment(count as u64);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, kind: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "kind" => kind.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt that will be retried.
    pub fn job_retried(queue: &str, kind: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "kind" => kind.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job discarded.
    pub fn job_discarded(queue: &str, kind: &str, error_type: &str) {
        counter!(
            names::JOBS_DISCARDED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    /// Record a job cancelled.
    pub fn job_cancelled() {
        counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
    }

    /// Record an attempt that exceeded its deadline.
    pub fn job_timed_out(queue: &str, kind: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record an attempt that panicked.
    pub fn job_panicked(queue: &str, kind: &str) {
        counter!(
            names::JOBS_PANICKED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record a claimed job with no handler.
    pub fn unknown_kind(queue: &str, kind: &str) {
        counter!(
            names::JOBS_UNKNOWN_KIND_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record stale jobs taken back by the rescuer.
    pub fn jobs_rescued(count: usize) {
        counter!(names::JOBS_RESCUED_TOTAL).increment(count as u64);
    }

    /// Record job wait time.
    pub fn job_wait_time(queue: &str, kind: &str, wait_time: Duration) {
        histogram!(
            names::JOB_WAIT_TIME_SECONDS,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .record(wait_time.as_secs_f64());
    }

    /// Record a failed store operation.
    pub fn store_error(operation: &'static str) {
        counter!(names::STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
    }
}

/// Slot usage recorder.
#[derive(Clone)]
pub struct SlotMetrics;

impl SlotMetrics {
    /// Update slot gauges for one queue.
    pub fn update(queue: &str, in_use: usize, configured: usize) {
        gauge!(names::SLOTS_IN_USE, "queue" => queue.to_string()).set(in_use as f64);
        gauge!(names::SLOTS_CONFIGURED, "queue" => queue.to_string()).set(configured as f64);
    }
}
