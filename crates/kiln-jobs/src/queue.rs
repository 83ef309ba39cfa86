//! Enqueue options.

use crate::error::{JobError, JobResult};
use crate::job::Job;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Named priority levels.
///
/// Lower values are claimed earlier within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum Priority {
    /// Time-sensitive work.
    Critical = -20,
    /// Important work.
    High = -10,
    /// Default priority.
    Normal = 0,
    /// Background work.
    Low = 10,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl From<Priority> for i16 {
    fn from(priority: Priority) -> Self {
        priority as i16
    }
}

/// Per-call enqueue options.
///
/// Unset fields fall back to the job type's defaults, then to the client
/// configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    queue: Option<String>,
    delay: Option<Duration>,
    scheduled_at: Option<DateTime<Utc>>,
    max_attempts: Option<i32>,
    priority: Option<i16>,
}

impl EnqueueOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Sets a delay before the job becomes eligible.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.scheduled_at = None;
        self
    }

    /// Schedules the job for a specific time.
    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self.delay = None;
        self
    }

    /// Sets the attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets a raw priority value.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets a named priority level.
    pub fn priority_level(self, priority: Priority) -> Self {
        self.priority(priority.into())
    }

    pub(crate) fn queue_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.queue.as_deref().unwrap_or(fallback)
    }

    pub(crate) fn max_attempts_or(&self, fallback: i32) -> i32 {
        self.max_attempts.unwrap_or(fallback)
    }

    pub(crate) fn priority_or(&self, fallback: i16) -> i16 {
        self.priority.unwrap_or(fallback)
    }

    /// Resolves the eligibility time relative to `now`.
    pub(crate) fn scheduled_at(&self, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        if let Some(at) = self.scheduled_at {
            return Ok(at);
        }
        match self.delay {
            Some(delay) => {
                let delay = ChronoDuration::from_std(delay)
                    .map_err(|_| JobError::Validation(format!("delay {:?} is out of range", delay)))?;
                now.checked_add_signed(delay)
                    .ok_or_else(|| JobError::Validation(format!("delay {:?} is out of range", delay)))
            }
            None => Ok(now),
        }
    }

    /// Applies the defaults declared on a typed job.
    pub(crate) fn with_job_defaults<J: Job>(mut self) -> Self {
        self.queue.get_or_insert_with(|| J::QUEUE.to_string());
        if self.max_attempts.is_none() {
            self.max_attempts = J::MAX_ATTEMPTS;
        }
        self.priority.get_or_insert(J::PRIORITY);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Digest;

    impl Job for Digest {
        const KIND: &'static str = "digest";
        const QUEUE: &'static str = "reports";
        const MAX_ATTEMPTS: Option<i32> = Some(3);
        const PRIORITY: i16 = 10;
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(i16::from(Priority::Low), 10);
    }

    #[test]
    fn test_delay_and_at_are_exclusive() {
        let now = Utc::now();
        let at = now + ChronoDuration::hours(1);

        let opts = EnqueueOptions::new().at(at).delay(Duration::from_secs(5));
        assert_eq!(opts.scheduled_at(now).unwrap(), now + ChronoDuration::seconds(5));

        let opts = EnqueueOptions::new().delay(Duration::from_secs(5)).at(at);
        assert_eq!(opts.scheduled_at(now).unwrap(), at);

        assert_eq!(EnqueueOptions::new().scheduled_at(now).unwrap(), now);
    }

    #[test]
    fn test_out_of_range_delay_is_rejected() {
        let opts = EnqueueOptions::new().delay(Duration::MAX);
        assert!(matches!(opts.scheduled_at(Utc::now()), Err(JobError::Validation(_))));
    }

    #[test]
    fn test_job_defaults_fill_unset_fields() {
        let opts = EnqueueOptions::new().with_job_defaults::<Digest>();
        assert_eq!(opts.queue_or("default"), "reports");
        assert_eq!(opts.max_attempts_or(25), 3);
        assert_eq!(opts.priority_or(0), 10);

        let opts = EnqueueOptions::new()
            .queue("urgent")
            .priority_level(Priority::Critical)
            .with_job_defaults::<Digest>();
        assert_eq!(opts.queue_or("default"), "urgent");
        assert_eq!(opts.priority_or(0), -20);
    }
}
