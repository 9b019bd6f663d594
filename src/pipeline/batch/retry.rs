//! Bounded retry with exponential backoff.
//!
//! Transient failures are retried up to `max_attempts` total attempts,
//! sleeping `base_delay * 2^(attempt-1)` between them. Permanent failures and
//! filter rejections return on the first attempt.

use std::time::Duration;

use super::error::OperationError;
use super::traits::Sleeper;

/// Default attempts per external call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay after the first failed attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Upper bound for any single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: MAX_BACKOFF,
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `call` receives the 1-based attempt number.
    pub fn run<T, F>(&self, sleeper: &dyn Sleeper, label: &str, mut call: F) -> Result<T, OperationError>
    where
        F: FnMut(u32) -> Result<T, OperationError>,
    {
        let mut attempt = 1;
        loop {
            match call(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        call = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "External call failed, retrying"
                    );
                    sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(
                            call = label,
                            attempts = attempt,
                            error = %e,
                            "Retry budget exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}
