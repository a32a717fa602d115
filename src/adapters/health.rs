use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use crate::model::{StrategyId, StrategySnapshot};

use super::guard::GuardedAdapter;

/// Shared last-known-good cache of strategy observations. Written by the
/// health loop and by successful APY reads, read lock-free by the accrual
/// engine and the query surface.
#[derive(Clone)]
pub struct ApyCache {
    inner: Arc<DashMap<StrategyId, StrategySnapshot>>,
}

pub fn new_apy_cache() -> ApyCache {
    ApyCache { inner: Arc::new(DashMap::new()) }
}

impl ApyCache {
    pub fn get(&self, strategy_id: &str) -> Option<StrategySnapshot> {
        self.inner.get(strategy_id).map(|s| s.clone())
    }

    /// Record a live APY observation.
    pub fn record_apy(&self, strategy_id: &str, apy_bps: u32, now: DateTime<Utc>) {
        self.inner
            .entry(strategy_id.to_string())
            .and_modify(|snapshot| {
                snapshot.apy_bps = apy_bps;
                snapshot.observed_at = now;
                snapshot.healthy = true;
            })
            .or_insert_with(|| StrategySnapshot {
                strategy_id: strategy_id.to_string(),
                observed_at: now,
                apy_bps,
                healthy: true,
                latency_ms: 0,
                probed_at: now,
            });
    }

    /// Record a health-probe outcome without touching the APY observation.
    pub fn record_probe(&self, strategy_id: &str, healthy: bool, latency_ms: u64, now: DateTime<Utc>) {
        self.inner
            .entry(strategy_id.to_string())
            .and_modify(|snapshot| {
                snapshot.healthy = healthy;
                snapshot.latency_ms = latency_ms;
                snapshot.probed_at = now;
            })
            .or_insert_with(|| StrategySnapshot {
                strategy_id: strategy_id.to_string(),
                // No APY observed yet: date the observation at the epoch so
                // staleness checks treat it as unusable.
                observed_at: DateTime::UNIX_EPOCH,
                apy_bps: 0,
                healthy,
                latency_ms,
                probed_at: now,
            });
    }
}

/// Probe every adapter once. Advisory only: failures land in the cache, the
/// pass itself never errors and never blocks a state-machine transition.
/// Returns true when any cached APY changed.
pub async fn run_health_pass(
    adapters: &HashMap<StrategyId, Arc<GuardedAdapter>>,
    timeout: Duration,
) -> bool {
    let mut changed = false;
    for guard in adapters.values() {
        let deadline = Instant::now() + timeout;
        if guard.probe(deadline).await {
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn probe_before_any_apy_reads_as_ancient() {
        let cache = new_apy_cache();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        cache.record_probe("tbill", true, 12, now);
        let snapshot = cache.get("tbill").unwrap();
        assert!(snapshot.healthy);
        assert!(snapshot.age_secs(now) > 600);

        cache.record_apy("tbill", 400, now);
        let snapshot = cache.get("tbill").unwrap();
        assert_eq!(snapshot.apy_bps, 400);
        assert_eq!(snapshot.age_secs(now), 0);
    }

    #[test]
    fn unhealthy_probe_keeps_last_known_apy() {
        let cache = new_apy_cache();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        cache.record_apy("tbill", 400, t0);
        cache.record_probe("tbill", false, 30, t0 + chrono::Duration::seconds(60));
        let snapshot = cache.get("tbill").unwrap();
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.apy_bps, 400);
        assert_eq!(snapshot.observed_at, t0);
    }
}
