//! Retry policies for failed jobs.

use crate::config::RetryConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest delay ever applied before a retry.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
    /// Linear backoff.
    Linear,
}

/// Backoff policy applied between attempts.
///
/// Delays never decrease as the attempt number grows. Jitter only applies
/// to the exponential strategy and is bounded by `multiplier - 1`, so a
/// jittered delay never exceeds the un-jittered delay of the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier (exponential only).
    pub multiplier: f64,

    /// Jitter factor (0.0 disables jitter).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::exponential()
            .with_initial_delay(Duration::from_millis(config.initial_delay_ms))
            .with_max_delay(Duration::from_millis(config.max_delay_ms))
            .with_multiplier(config.multiplier)
            .with_jitter(config.jitter_factor)
    }
}

impl RetryPolicy {
    /// Creates a fixed delay retry policy.
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = duration_ms(delay);
        Self {
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 1000, // 1 second
            max_delay_ms: 3_600_000, // 1 hour
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Creates a linear backoff retry policy.
    pub fn linear(increment: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            initial_delay_ms: duration_ms(increment),
            max_delay_ms: duration_ms(max_delay),
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff multiplier. Values below 1.0 are raised to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Un-jittered delay for the given attempt number (1-based).
    pub fn base_delay(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1);

        let delay_ms = match self.strategy {
            RetryStrategy::Fixed => self.initial_delay_ms as f64,
            RetryStrategy::Exponential => {
                self.initial_delay_ms as f64 * self.multiplier.powi(attempt - 1)
            }
            RetryStrategy::Linear => self.initial_delay_ms as f64 * f64::from(attempt),
        };

        clamp_delay(delay_ms, self.max_delay_ms)
    }

    /// Delay for the given attempt number, jitter included.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let jitter = self.effective_jitter();
        if jitter <= 0.0 {
            return self.base_delay(attempt);
        }

        let attempt = attempt.max(1);
        let uncapped = self.initial_delay_ms as f64 * self.multiplier.powi(attempt - 1);
        let factor = 1.0 + rand::rng().random_range(0.0..jitter);
        clamp_delay(uncapped * factor, self.max_delay_ms)
    }

    /// Time at which the next attempt becomes eligible, always strictly
    /// after `now`.
    pub fn next_attempt_at(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt).max(MIN_RETRY_DELAY);
        let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn effective_jitter(&self) -> f64 {
        if self.strategy != RetryStrategy::Exponential {
            return 0.0;
        }
        self.jitter_factor.min(self.multiplier - 1.0).max(0.0)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn clamp_delay(delay_ms: f64, max_delay_ms: u64) -> Duration {
    let capped = if delay_ms.is_finite() {
        delay_ms.min(max_delay_ms as f64).max(0.0)
    } else {
        max_delay_ms as f64
    };
    Duration::from_millis(capped as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_retry() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5000));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(5000));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential().without_jitter();

        // 1st retry: 1000ms
        // 2nd retry: 2000ms
        // 3rd retry: 4000ms
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::linear(Duration::from_millis(1000), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(i32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jittered_backoff_is_monotonic() {
        let policy = RetryPolicy::exponential().with_jitter(1.0);

        for attempt in 1..20 {
            let current = policy.delay_for_attempt(attempt);
            let next_floor = policy.base_delay(attempt + 1);
            assert!(current <= next_floor, "attempt {attempt}: {current:?} > {next_floor:?}");
            assert!(current >= policy.base_delay(attempt));
        }
    }

    #[test]
    fn test_jitter_bounded_by_multiplier() {
        let policy = RetryPolicy::exponential()
            .with_multiplier(1.5)
            .with_jitter(0.9);
        assert!((policy.effective_jitter() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_next_attempt_strictly_in_future() {
        let now = Utc::now();
        let policy = RetryPolicy::fixed(Duration::ZERO);
        assert!(policy.next_attempt_at(1, now) > now);

        let policy = RetryPolicy::exponential();
        assert!(policy.next_attempt_at(3, now) >= now + ChronoDuration::seconds(4));
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 3.0,
            jitter_factor: 0.0,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(30));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(90));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(100));
    }
}
