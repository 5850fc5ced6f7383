//! Reconnection retry policy.

use std::time::Duration;

use crate::error::TransportError;

/// Whether to retry and how long to back off first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    #[must_use]
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }

    #[must_use]
    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decides, per attempt, whether the reconnect worker keeps trying.
pub trait RetryPolicy: Send {
    fn should_retry(&mut self, attempt: u32, last_error: &TransportError) -> RetryDecision;
}

/// Exponential backoff capped at a maximum delay, with an optional cap on
/// the number of attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoffRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoffRetry {
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let multiplier = self
            .backoff_factor
            .powi(attempt.try_into().unwrap_or(i32::MAX));
        let delay = self.initial_delay.mul_f64(multiplier);
        delay.min(self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn should_retry(&mut self, attempt: u32, last_error: &TransportError) -> RetryDecision {
        if !last_error.is_retryable() {
            return RetryDecision::give_up();
        }
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return RetryDecision::give_up();
            }
        }
        RetryDecision::retry_after(self.calculate_delay(attempt))
    }
}

/// Never retries; every failure is terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&mut self, _attempt: u32, _last_error: &TransportError) -> RetryDecision {
        RetryDecision::give_up()
    }
}
