//! Shared retry policy with exponential backoff.
//!
//! The scanner and the join writer both face the same throttling behavior from
//! the store, so retry handling is centralized here instead of being scattered
//! across call sites. Only errors classified transient by
//! [`crate::error::ErrorKind::is_transient`] are retried; everything else
//! escalates immediately so the source pass can abort without advancing its
//! watermark.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::SyncResult;

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Runs `operation`, retrying transient failures until it succeeds, fails
    /// with a non-transient error, or the attempt budget is exhausted.
    pub async fn retry<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind().is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient store error, backing off before retry"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Full-jitter delay for the given zero-based attempt: a uniform sample
    /// from zero to `base * 2^attempt`, capped at `max_delay`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);

        let upper = exponential.as_millis() as u64;
        if upper == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::thread_rng().gen_range(0..=upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sync_error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = quick_policy(5)
            .retry("test", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(sync_error!(ErrorKind::StoreThrottled, "throttled"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: SyncResult<()> = quick_policy(5)
            .retry("test", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(sync_error!(ErrorKind::StoreUnavailable, "down"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::StoreUnavailable);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: SyncResult<()> = quick_policy(3)
            .retry("test", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(sync_error!(ErrorKind::StoreThrottled, "throttled"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::StoreThrottled);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_delay_is_bounded() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(300));

        for attempt in 0..10 {
            assert!(policy.backoff_delay(attempt) <= Duration::from_millis(300));
        }
    }
}
