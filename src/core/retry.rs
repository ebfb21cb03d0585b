//! Retry policy for storage-backed operations.
//!
//! Supports exponential backoff with a capped delay and configurable max
//! attempts.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Retry policy for an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts, not including the initial attempt (0 = no retries).
    /// For example, `max_attempts = 3` means up to 3 retries after the initial failure,
    /// for a total of 4 attempts (1 initial + 3 retries).
    pub max_attempts: u32,

    /// Delay before the first retry. Doubles on each further retry.
    #[serde(with = "serde_millis")]
    pub initial_delay: Duration,

    /// Upper bound for a single delay.
    #[serde(with = "serde_millis")]
    pub max_delay: Duration,

    /// Condition for when to retry.
    pub retry_on: RetryCondition,
}

/// Conditions under which an operation should be retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryCondition {
    /// Retry on any error.
    Always,

    /// Retry only on transient errors (timeouts, I/O failures).
    #[default]
    TransientOnly,

    /// Never retry, regardless of max_attempts.
    Never,
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retry_on: RetryCondition::Never,
        }
    }

    /// Create a policy with exponential backoff.
    ///
    /// # Arguments
    /// * `max_attempts` - Maximum retry attempts (not including initial try)
    /// * `initial_delay` - Delay before the first retry
    /// * `max_delay` - Cap for any single delay
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            retry_on: RetryCondition::TransientOnly,
        }
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0 && self.retry_on != RetryCondition::Never
    }

    /// Check if we should retry after `attempts` failed attempts.
    pub fn should_retry<E: Transient>(&self, attempts: u32, error: &E) -> bool {
        let eligible = match self.retry_on {
            RetryCondition::Never => false,
            RetryCondition::Always => true,
            RetryCondition::TransientOnly => error.is_transient(),
        };
        eligible && attempts <= self.max_attempts
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempts, &e) => {
                    let delay = self.delay_for(attempts);
                    tracing::warn!(
                        operation = label,
                        attempt = attempts,
                        max_attempts = self.max_attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Default policy: three retries starting at 100ms, capped at 2s.
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100), Duration::from_secs(2))
    }
}

/// Serde helper for Duration serialization as milliseconds.
mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
