//! Job records, typed job arguments and the execution context.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Store-assigned job identifier.
///
/// Identifiers increase monotonically and break ordering ties within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Wraps a raw identifier.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for claim once `scheduled_at` has passed.
    Available,
    /// Claimed by exactly one worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed, waiting for its next attempt.
    Retryable,
    /// Failed permanently.
    Discarded,
    /// Cancelled before it ran to completion.
    Cancelled,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 6] = [
        JobState::Available,
        JobState::Running,
        JobState::Completed,
        JobState::Retryable,
        JobState::Discarded,
        JobState::Cancelled,
    ];

    /// Returns the persisted name of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Returns true for states that accept no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Available
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JobError::Internal(format!("Unknown job state in store: {}", s)))
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID.
    pub id: JobId,

    /// Handler kind.
    pub kind: String,

    /// Queue name.
    pub queue: String,

    /// Serialized arguments, opaque to the store.
    pub payload: String,

    /// Current state.
    pub state: JobState,

    /// Ordering hint within the queue (lower runs earlier).
    pub priority: i16,

    /// Execution attempts started so far.
    pub attempt: i32,

    /// Attempt ceiling.
    pub max_attempts: i32,

    /// Error from the last failed attempt.
    pub last_error: Option<String>,

    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,

    /// When the current or last attempt started.
    pub attempted_at: Option<DateTime<Utc>>,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the job reached a terminal state.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Returns true if no attempts remain after the current one.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job ready to be inserted into a store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Handler kind.
    pub kind: String,

    /// Queue name.
    pub queue: String,

    /// Serialized arguments.
    pub payload: String,

    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,

    /// Attempt ceiling.
    pub max_attempts: i32,

    /// Ordering hint within the queue.
    pub priority: i16,
}

impl NewJob {
    /// Checks the invariants every store enforces before inserting.
    pub fn validate(&self) -> JobResult<()> {
        if self.kind.trim().is_empty() {
            return Err(JobError::Validation("job kind must not be empty".to_string()));
        }
        if self.queue.trim().is_empty() {
            return Err(JobError::Validation("queue name must not be empty".to_string()));
        }
        if self.max_attempts <= 0 {
            return Err(JobError::Validation(format!(
                "max_attempts must be positive, got {}",
                self.max_attempts
            )));
        }
        Ok(())
    }
}

/// Typed job arguments.
///
/// Implement this for the argument struct of each job type. The struct is
/// serialized with serde when enqueued and handed to the matching
/// [`Worker`](crate::registry::Worker) when the job runs.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
///     subject: String,
/// }
///
/// impl Job for SendEmail {
///     const KIND: &'static str = "send_email";
///     const QUEUE: &'static str = "mailers";
/// }
/// ```
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique kind for this job type.
    const KIND: &'static str;

    /// Queue used when the enqueue options name none.
    const QUEUE: &'static str = "default";

    /// Attempt ceiling; `None` falls back to the client default.
    const MAX_ATTEMPTS: Option<i32> = None;

    /// Priority used when the enqueue options name none.
    const PRIORITY: i16 = 0;
}

/// Job execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Handler kind.
    pub kind: String,

    /// Queue name.
    pub queue: String,

    /// Current attempt number (1-based).
    pub attempt: i32,

    /// Maximum attempts allowed.
    pub max_attempts: i32,

    /// Job was scheduled at this time.
    pub scheduled_at: DateTime<Utc>,

    /// Job started executing at this time.
    pub started_at: DateTime<Utc>,

    cancellation: CancellationToken,
}

impl JobContext {
    /// Builds the context for one attempt of a claimed record.
    pub fn new(record: &JobRecord, cancellation: CancellationToken) -> Self {
        Self {
            job_id: record.id,
            kind: record.kind.clone(),
            queue: record.queue.clone(),
            attempt: record.attempt,
            max_attempts: record.max_attempts,
            scheduled_at: record.scheduled_at,
            started_at: Utc::now(),
            cancellation,
        }
    }

    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> i32 {
        (self.max_attempts - self.attempt).max(0)
    }

    /// Returns true once shutdown or the job deadline asked the handler to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the handler is asked to stop.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Returns the cancellation token for this attempt.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
