use std::path::Path;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::adapters::StrategyKind;
use crate::error::EngineError;
use crate::model::amount::FRACTIONAL_DIGITS;
use crate::model::{ChainId, StrategyId};

/// User/merchant/protocol yield split in basis points. Must sum to 10 000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DistributionPolicy {
    pub user_bps: u32,
    pub merchant_bps: u32,
    pub protocol_bps: u32,
}

impl Default for DistributionPolicy {
    fn default() -> Self {
        DistributionPolicy { user_bps: 7_000, merchant_bps: 2_000, protocol_bps: 1_000 }
    }
}

/// A strategy endpoint registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategyEndpoint {
    pub id: StrategyId,
    pub kind: StrategyKind,
    pub base_url: String,
}

/// A chain relayer endpoint registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChainEndpoint {
    pub id: ChainId,
    pub base_url: String,
}

/// Engine configuration. Loaded from a JSON file; every field has a default
/// matching the documented recognized options.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Yield snapshot cadence, seconds.
    pub snapshot_interval_secs: u64,
    /// APY data older than this is marked stale on snapshots, seconds.
    pub stale_after_secs: u64,
    /// Beyond this staleness, releases are held for fresh data, seconds.
    pub max_stale_interval_secs: u64,

    /// Consecutive failures that open a circuit breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before a half-open probe, seconds.
    pub open_duration_secs: u64,

    /// Retry attempts for transient adapter/chain failures.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter applied to each backoff delay, percent of the delay.
    pub jitter_pct: u8,

    /// Adapter health probe cadence, seconds.
    pub health_interval_secs: u64,
    /// Non-terminal payments older than this are force-failed, seconds.
    pub abandonment_horizon_secs: u64,

    pub distribution_policy: DistributionPolicy,
    /// Fractional digits of the stable-unit. The engine arithmetic is fixed
    /// at 6; other values are rejected at validation.
    pub yield_precision: u32,

    /// Bound on concurrently admitted commands before `Overloaded`.
    pub command_queue_depth: usize,

    /// Deadline for escrow deposit/release/refund calls, seconds.
    pub chain_timeout_secs: u64,
    /// Per-step bridge deadlines, seconds.
    pub bridge_burn_timeout_secs: u64,
    pub bridge_attestation_timeout_secs: u64,
    pub bridge_mint_timeout_secs: u64,
    /// Attestation polling cadence, milliseconds.
    pub attestation_poll_interval_ms: u64,

    /// Registered strategies (ignored when running with mock collaborators).
    pub strategies: Vec<StrategyEndpoint>,
    /// Registered chain relayers (ignored when running with mock collaborators).
    pub chains: Vec<ChainEndpoint>,
    /// Attestation service endpoint.
    pub attestation_url: Option<String>,
    /// Party identifiers rejected at the compliance screen.
    pub compliance_denylist: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            snapshot_interval_secs: 60,
            stale_after_secs: 120,
            max_stale_interval_secs: 600,
            failure_threshold: 5,
            open_duration_secs: 30,
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter_pct: 20,
            health_interval_secs: 30,
            abandonment_horizon_secs: 7 * 86_400,
            distribution_policy: DistributionPolicy::default(),
            yield_precision: FRACTIONAL_DIGITS,
            command_queue_depth: 256,
            chain_timeout_secs: 60,
            bridge_burn_timeout_secs: 120,
            bridge_attestation_timeout_secs: 300,
            bridge_mint_timeout_secs: 120,
            attestation_poll_interval_ms: 5_000,
            strategies: Vec::new(),
            chains: Vec::new(),
            attestation_url: None,
            compliance_denylist: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, falling back to defaults for absent fields.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: EngineConfig =
            serde_json::from_str(&contents).context("parsing config file")?;
        config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let policy = &self.distribution_policy;
        if policy.user_bps + policy.merchant_bps + policy.protocol_bps != 10_000 {
            return Err(EngineError::InvalidParameters(
                "distribution_policy must sum to 10000 bps".into(),
            ));
        }
        if self.yield_precision != FRACTIONAL_DIGITS {
            return Err(EngineError::InvalidParameters(format!(
                "yield_precision {} unsupported, engine arithmetic is fixed at {}",
                self.yield_precision, FRACTIONAL_DIGITS
            )));
        }
        if self.command_queue_depth == 0 {
            return Err(EngineError::InvalidParameters(
                "command_queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}
