//! Minimum-interval async rate limiter
//!
//! Shared by every external-call site (LLM batches, geocoding requests).
//! `acquire` admits one caller at a time and sleeps while holding the lock so
//! that consecutive admissions are at least `1 / calls_per_second` apart.
//! `release` only maintains a diagnostic in-flight counter.

use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limiter enforcing a minimum interval between permitted calls
#[derive(Debug)]
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
    active: AtomicUsize,
}

impl RateLimiter {
    /// Create a limiter admitting at most `calls_per_second` calls per second
    ///
    /// Fractional rates are allowed (0.125 = one call every 8 seconds).
    pub fn new(calls_per_second: f64) -> Result<Self> {
        if !calls_per_second.is_finite() || calls_per_second <= 0.0 {
            return Err(Error::Config(format!(
                "calls_per_second must be > 0 (got {})",
                calls_per_second
            )));
        }

        Ok(Self {
            last_call: Mutex::new(None),
            min_interval: Duration::from_secs_f64(1.0 / calls_per_second),
            active: AtomicUsize::new(0),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Number of operations between `acquire` and `release`
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Wait until the next call is allowed under the rate limit
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;

        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(active, "Rate limiter: acquiring");

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }

    /// Mark the completion of an operation admitted by `acquire`
    pub fn release(&self) {
        let previous = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .unwrap_or(0);
        tracing::debug!(active = previous.saturating_sub(1), "Rate limiter: released");
    }

    /// Acquire and return a guard that releases on drop
    pub async fn permit(&self) -> RatePermit<'_> {
        self.acquire().await;
        RatePermit { limiter: self }
    }
}

/// Guard returned by [`RateLimiter::permit`]
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(2.0).unwrap();
        assert_eq!(limiter.min_interval(), Duration::from_millis(500));

        let slow = RateLimiter::new(0.125).unwrap();
        assert_eq!(slow.min_interval(), Duration::from_secs(8));
    }

    #[test]
    fn test_non_positive_rate_rejected() {
        assert!(matches!(RateLimiter::new(0.0), Err(Error::Config(_))));
        assert!(matches!(RateLimiter::new(-1.0), Err(Error::Config(_))));
        assert!(matches!(RateLimiter::new(f64::NAN), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_rate_limiter_timing() {
        let limiter = RateLimiter::new(2.0).unwrap();

        let start = Instant::now();

        // First request - no wait
        limiter.acquire().await;
        let first_elapsed = start.elapsed();

        // Second request - should wait ~500ms
        limiter.acquire().await;
        let second_elapsed = start.elapsed();

        assert!(first_elapsed < Duration::from_millis(100));
        assert!(second_elapsed >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_are_spaced() {
        let limiter = Arc::new(RateLimiter::new(2.0).unwrap());
        let mut join_set = JoinSet::new();

        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            join_set.spawn(async move {
                limiter.acquire().await;
                let admitted = Instant::now();
                limiter.release();
                admitted
            });
        }

        let mut admissions = Vec::new();
        while let Some(result) = join_set.join_next().await {
            admissions.push(result.expect("Task panicked"));
        }
        admissions.sort();

        for pair in admissions.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(450),
                "admissions only {:?} apart",
                gap
            );
        }
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_permit_releases_on_drop() {
        let limiter = RateLimiter::new(100.0).unwrap();
        {
            let _permit = limiter.permit().await;
            assert_eq!(limiter.active(), 1);
        }
        assert_eq!(limiter.active(), 0);

        // Unbalanced release never underflows
        limiter.release();
        assert_eq!(limiter.active(), 0);
    }
}
