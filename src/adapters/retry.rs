use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::EngineConfig;

/// Errors that may be retried. Only transient classifications (network,
/// 5xx, timeouts) qualify; permanent errors surface immediately.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff schedule: `base_delay · 2ⁿ ± jitter`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: u8,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_pct: config.jitter_pct,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
        let capped = scaled.min(self.max_delay);
        if self.jitter_pct == 0 || capped.is_zero() {
            return capped;
        }
        let capped_ms = capped.as_millis() as i64;
        let jitter_ms = capped_ms * self.jitter_pct as i64 / 100;
        let offset = rand::rng().random_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((capped_ms + offset).max(0) as u64)
    }
}

/// Retry a transient-failing operation with backoff, respecting `deadline`.
///
/// Permanent errors and exhausted budgets return the last error unchanged.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    f: F,
) -> Result<T, E>
where
    E: Retryable,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_transient() || attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.backoff_delay(attempt);
                if Instant::now() + delay >= deadline {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_pct: 0,
        }
    }

    #[tokio::test]
    async fn transient_errors_use_the_full_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_transient(&fast_policy(3), Instant::now() + Duration::from_secs(5), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Transient) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_transient(&fast_policy(3), Instant::now() + Duration::from_secs(5), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Permanent) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(
            &fast_policy(3),
            Instant::now() + Duration::from_secs(5),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err(TestError::Transient) } else { Ok(n) }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn deadline_cuts_the_budget_short() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_transient(&fast_policy(10), Instant::now(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Transient) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5_000),
            jitter_pct: 0,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_the_band() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(5_000),
            jitter_pct: 20,
        };
        for _ in 0..100 {
            let delay = policy.backoff_delay(0).as_millis() as i64;
            assert!((800..=1_200).contains(&delay), "delay {delay} outside ±20%");
        }
    }
}
