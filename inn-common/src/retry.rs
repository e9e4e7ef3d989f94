//! Exponential backoff retry for calls to external providers
//!
//! **Algorithm:**
//! 1. Attempt operation
//! 2. If successful, return result
//! 3. If the error is retryable and attempts remain: log WARN, sleep
//!    `delay * (1 + U(-jitter, jitter))`, multiply delay, retry
//! 4. Otherwise return the last error

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    /// Relative jitter, 0.1 = ±10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + offset)
    }
}

/// Retry `operation` with exponential backoff while `is_retryable` holds
///
/// # Arguments
/// * `operation_name` - Name for logging (e.g., "llm batch 3", "geocode 9001")
/// * `policy` - Attempt cap and delay schedule
/// * `is_retryable` - Classifies an error as transient
/// * `operation` - Async closure performing one attempt
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "All retry attempts failed"
                    );
                    return Err(err);
                }

                let delay = policy.jittered(policy.base_delay(attempt));
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying after backoff"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
