use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::payment::StrategyId;

/// Latest observation of a strategy, written by the health loop and by
/// successful APY reads. Read-only to the accrual engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StrategySnapshot {
    pub strategy_id: StrategyId,
    /// When `apy_bps` was last read from a live call. Staleness is measured
    /// against this instant, so an unhealthy strategy keeps serving its last
    /// known good APY while ageing towards the stale thresholds.
    pub observed_at: DateTime<Utc>,
    pub apy_bps: u32,
    /// Latest circuit-breaker / probe verdict.
    pub healthy: bool,
    pub latency_ms: u64,
    /// When the health loop last probed this strategy.
    pub probed_at: DateTime<Utc>,
}

impl StrategySnapshot {
    /// Age of the APY observation at `now`, in seconds (0 if the clock went
    /// back).
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.observed_at).num_seconds().max(0) as u64
    }
}
