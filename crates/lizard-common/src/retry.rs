//! Retry and timeout utilities.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::CommonError;

/// Retry policy for operations an operator may want repeated, such as an install
/// against a flaky origin.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Default backoff with a custom attempt count.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi((attempt - 2) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

/// Run a fallible async operation until it succeeds or the policy is exhausted.
///
/// Returns the last error when every attempt failed.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + From<CommonError>,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            let delay = policy.delay_for_attempt(attempt);
            debug!(attempt, ?delay, "Retrying after delay");
            sleep(delay).await;
        }

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(attempt, max_attempts = policy.max_attempts, error = %e, "Operation failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| CommonError::NoAttempts.into()))
}

/// Run a future with a deadline.
pub async fn with_timeout<T, Fut>(timeout: Duration, future: Fut) -> Result<T, CommonError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| CommonError::Timeout(timeout))
}
