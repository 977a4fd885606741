//! Retry policies.
//!
//! Three policies live here:
//!
//! - [`TaskRetryPolicy`]: how many on-chain attempts a task gets per
//!   invocation round, and how long to wait before the next attempt
//!   (`base * 4^attempts_this_round`).
//! - [`PollBackoff`]: how long the confirmation poller waits before checking
//!   a receipt again (`base * 2^polls`, capped).
//! - [`RetryConfig`] / [`RetryExecutor`]: in-place retry of transient RPC and
//!   webhook failures with exponential backoff and jitter.
//!
//! The countdowns are always computed by the caller and handed to the
//! scheduler; nothing here sleeps except [`RetryExecutor`].

use crate::error::{WorkerError, WorkerResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry budget and backoff for task attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRetryPolicy {
    /// Attempts allowed per invocation round.
    pub max_retries: u32,
    /// Base countdown before a new attempt.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for a single countdown.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for TaskRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl TaskRetryPolicy {
    /// Attempts made in the current invocation round.
    ///
    /// Every earlier round is assumed to have used its full budget, which is
    /// what `retry_task` guarantees by only being useful after a round failed.
    pub fn attempts_this_round(&self, total_attempts: u32, previous_invocations: u32) -> u32 {
        total_attempts.saturating_sub(self.max_retries.saturating_mul(previous_invocations))
    }

    /// Whether the round's budget is used up.
    pub fn is_exhausted(&self, attempts_this_round: u32) -> bool {
        attempts_this_round >= self.max_retries
    }

    /// Countdown before the next attempt: `base * 4^attempts_this_round`.
    pub fn backoff(&self, attempts_this_round: u32) -> Duration {
        let factor = 4u32.saturating_pow(attempts_this_round);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Backoff for receipt polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBackoff {
    /// Delay before the first check.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl PollBackoff {
    /// Delay before poll number `polls`: `base * 2^polls`, capped.
    pub fn delay(&self, polls: u32) -> Duration {
        let factor = 2u32.saturating_pow(polls);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Configuration for in-place retry of transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Initial delay before the first retry (in milliseconds).
    pub initial_delay_ms: u64,
    /// Maximum delay between retries (in milliseconds).
    pub max_delay_ms: u64,
    /// Base for exponential backoff (typically 2.0).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
    /// Jitter factor (0.0 to 1.0) - how much randomness to add.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
            jitter: true,
            jitter_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// Creates a new builder for RetryConfig.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Calculates the delay for a given attempt number.
    #[allow(clippy::cast_possible_truncation)] // Delay is bounded by max_delay_ms
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let base_delay = self.initial_delay_ms as f64
            * self.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            (capped_delay + jitter).max(0.0)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Builder for RetryConfig.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    exponential_base: Option<f64>,
    jitter: Option<bool>,
    jitter_factor: Option<f64>,
}

impl RetryConfigBuilder {
    /// Sets the maximum number of retry attempts.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the initial delay before the first retry (in milliseconds).
    pub fn initial_delay_ms(mut self, initial_delay_ms: u64) -> Self {
        self.initial_delay_ms = Some(initial_delay_ms);
        self
    }

    /// Sets the maximum delay between retries (in milliseconds).
    pub fn max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    /// Sets the base for exponential backoff.
    pub fn exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = Some(base);
        self
    }

    /// Enables or disables jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Sets the jitter factor (0.0 to 1.0).
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = Some(factor.clamp(0.0, 1.0));
        self
    }

    /// Builds the RetryConfig.
    pub fn build(self) -> RetryConfig {
        let default = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            initial_delay_ms: self.initial_delay_ms.unwrap_or(default.initial_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(default.max_delay_ms),
            exponential_base: self.exponential_base.unwrap_or(default.exponential_base),
            jitter: self.jitter.unwrap_or(default.jitter),
            jitter_factor: self.jitter_factor.unwrap_or(default.jitter_factor),
        }
    }
}

/// Executes an async operation with automatic retry of transient errors.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Creates a new retry executor with the given config.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Creates a retry executor with default config.
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Executes an async operation, retrying errors for which
    /// [`WorkerError::is_retryable`] holds, up to the configured maximum.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> WorkerResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = WorkerResult<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if attempt >= self.config.max_retries || !error.is_retryable() {
                        return Err(error);
                    }

                    attempt += 1;
                    let delay = self.config.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.sanitized_message(),
                        "Retrying after transient error"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// Duration fields are written as integer milliseconds in config files.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
