use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::engine::clock::Clock;
use crate::model::{Amount, PositionRef};

use super::breaker::{BreakerState, CircuitBreaker};
use super::health::ApyCache;
use super::retry::RetryPolicy;
use super::{AdapterError, StrategyAdapter, StrategySettlement};

/// Failure surface of a guarded call after breaker gating and retries.
#[derive(Debug, thiserror::Error)]
pub enum GuardedError {
    /// Circuit open, retries exhausted, or the strategy reported itself
    /// unhealthy. The operation may be retried later.
    #[error("strategy unavailable")]
    Unavailable,
    /// Non-retryable rejection from the strategy endpoint.
    #[error("{0}")]
    Permanent(String),
}

/// Wraps a [`StrategyAdapter`] with the per-adapter circuit breaker, the
/// retry schedule, and the shared last-known-APY cache.
pub struct GuardedAdapter {
    adapter: Arc<dyn StrategyAdapter>,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cache: ApyCache,
}

impl GuardedAdapter {
    pub fn new(
        adapter: Arc<dyn StrategyAdapter>,
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
        cache: ApyCache,
    ) -> Self {
        GuardedAdapter {
            adapter,
            breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.open_duration_secs),
            ),
            policy: RetryPolicy::from_config(config),
            clock,
            cache,
        }
    }

    pub fn strategy_id(&self) -> &str {
        self.adapter.strategy_id()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state(self.clock.now())
    }

    pub async fn allocate(
        &self,
        op_id: &str,
        payment_id: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<PositionRef, GuardedError> {
        let adapter = self.adapter.clone();
        let op_id = op_id.to_string();
        let payment_id = payment_id.to_string();
        self.run(move || {
            let adapter = adapter.clone();
            let op_id = op_id.clone();
            let payment_id = payment_id.clone();
            async move { adapter.allocate(&op_id, &payment_id, amount, deadline).await }
        })
        .await
    }

    pub async fn withdraw(
        &self,
        op_id: &str,
        position_ref: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<StrategySettlement, GuardedError> {
        let adapter = self.adapter.clone();
        let op_id = op_id.to_string();
        let position_ref = position_ref.to_string();
        self.run(move || {
            let adapter = adapter.clone();
            let op_id = op_id.clone();
            let position_ref = position_ref.clone();
            async move { adapter.withdraw(&op_id, &position_ref, amount, deadline).await }
        })
        .await
    }

    /// Current APY in bps. Falls back to the cached snapshot when the live
    /// read fails or the breaker is open; the bool is true for cached reads.
    pub async fn apy_bps(&self, deadline: Instant) -> Result<(u32, bool), GuardedError> {
        let adapter = self.adapter.clone();
        let live = self
            .run(move || {
                let adapter = adapter.clone();
                async move { adapter.current_apy(deadline).await }
            })
            .await;
        match live {
            Ok(bps) => {
                self.cache_apy(bps);
                Ok((bps, false))
            }
            Err(err) => match self.cache.get(self.strategy_id()) {
                Some(snapshot) => {
                    tracing::debug!(
                        strategy = %self.strategy_id(),
                        apy_bps = snapshot.apy_bps,
                        "serving cached APY"
                    );
                    Ok((snapshot.apy_bps, true))
                }
                None => Err(err),
            },
        }
    }

    /// Health probe. Never propagates errors; the result lands in the shared
    /// snapshot cache. Returns true when the cached APY value changed.
    pub async fn probe(&self, deadline: Instant) -> bool {
        let before = self.cache.get(self.strategy_id()).map(|s| s.apy_bps);

        let adapter = self.adapter.clone();
        let health = self
            .run(move || {
                let adapter = adapter.clone();
                async move { adapter.health(deadline).await }
            })
            .await;

        match health {
            Ok(report) if report.healthy => {
                self.cache.record_probe(
                    self.strategy_id(),
                    true,
                    report.latency_ms,
                    self.clock.now(),
                );
                // Healthy probe refreshes the APY observation as well.
                let adapter = self.adapter.clone();
                if let Ok(bps) = self
                    .run(move || {
                        let adapter = adapter.clone();
                        async move { adapter.current_apy(deadline).await }
                    })
                    .await
                {
                    self.cache_apy(bps);
                }
            }
            Ok(report) => {
                tracing::warn!(strategy = %self.strategy_id(), "strategy reported unhealthy");
                self.cache.record_probe(
                    self.strategy_id(),
                    false,
                    report.latency_ms,
                    self.clock.now(),
                );
            }
            Err(err) => {
                tracing::warn!(strategy = %self.strategy_id(), error = %err, "health probe failed");
                self.cache.record_probe(self.strategy_id(), false, 0, self.clock.now());
            }
        }

        self.cache.get(self.strategy_id()).map(|s| s.apy_bps) != before
    }

    fn cache_apy(&self, apy_bps: u32) {
        self.cache.record_apy(self.strategy_id(), apy_bps, self.clock.now());
    }

    /// Breaker-gated call with transient retries. Every physical attempt is
    /// admitted by and reported to the breaker individually, so an outage
    /// opens it mid-retry instead of after the full budget.
    async fn run<T, F, Fut>(&self, f: F) -> Result<T, GuardedError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = 0;
        loop {
            if !self.breaker.try_acquire(self.clock.now()) {
                return Err(GuardedError::Unavailable);
            }
            match f().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.record_failure(self.clock.now());
                    tracing::debug!(
                        strategy = %self.strategy_id(),
                        attempt,
                        error = %err,
                        "adapter call failed"
                    );
                    match err {
                        AdapterError::Permanent(msg) => return Err(GuardedError::Permanent(msg)),
                        AdapterError::Unhealthy(_) => return Err(GuardedError::Unavailable),
                        AdapterError::Transient(_) if attempt < self.policy.max_retries => {
                            tokio::time::sleep(self.policy.backoff_delay(attempt)).await;
                            attempt += 1;
                        }
                        AdapterError::Transient(_) => return Err(GuardedError::Unavailable),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::adapters::health::new_apy_cache;
    use crate::adapters::mock::MockStrategy;
    use crate::engine::clock::ManualClock;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            failure_threshold: 3,
            open_duration_secs: 30,
            max_retries: 0,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_pct: 0,
            ..EngineConfig::default()
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn falls_back_to_cached_apy_when_breaker_opens() {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let cache = new_apy_cache();
        let mock = Arc::new(MockStrategy::new("tbill", 400));
        let guard = GuardedAdapter::new(mock.clone(), &fast_config(), clock.clone(), cache);

        // Seed the cache with a healthy read.
        assert_eq!(guard.apy_bps(deadline()).await.unwrap(), (400, false));

        mock.fail_next(100);
        for _ in 0..3 {
            let (bps, cached) = guard.apy_bps(deadline()).await.unwrap();
            assert_eq!(bps, 400);
            assert!(cached);
        }
        assert_eq!(guard.breaker_state(), BreakerState::Open);

        // Open breaker: the mock no longer sees calls, reads stay cached.
        let before = mock.apy_calls();
        assert_eq!(guard.apy_bps(deadline()).await.unwrap(), (400, true));
        assert_eq!(mock.apy_calls(), before);

        // Past the window, a successful probe closes the breaker.
        clock.advance_secs(31);
        mock.fail_next(0);
        assert!(!guard.probe(deadline()).await);
        assert_eq!(guard.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn permanent_errors_bypass_retries() {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let mock = Arc::new(MockStrategy::new("tbill", 400));
        mock.set_permanent_failure(Some("position closed".into()));
        let mut config = fast_config();
        config.max_retries = 3;
        let guard = GuardedAdapter::new(mock.clone(), &config, clock, new_apy_cache());

        let err = guard
            .allocate("op-1", "pay-1", Amount::from_micros(1_000_000), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, GuardedError::Permanent(_)));
        assert_eq!(mock.allocate_calls(), 1);
    }
}
