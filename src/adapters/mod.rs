pub mod breaker;
pub mod guard;
pub mod health;
pub mod http;
pub mod mock;
pub mod retry;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::model::{Amount, PositionRef, TxRef};

pub use guard::{GuardedAdapter, GuardedError};
pub use health::ApyCache;
pub use retry::{RetryPolicy, Retryable};

/// Outcome classification for adapter calls. The engine retries `Transient`
/// failures, aborts on `Permanent`, and degrades to cached data on
/// `Unhealthy`.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("strategy unhealthy: {0}")]
    Unhealthy(String),
}

impl Retryable for AdapterError {
    fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// Settlement returned by a strategy withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySettlement {
    pub reference: TxRef,
    pub principal: Amount,
    pub yield_paid: Amount,
}

/// Probe result for a strategy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// The capability set the engine consumes per strategy. Concrete variants
/// (T-bill, delta-neutral, lending) differ only in configuration and the
/// external endpoint; the engine treats them interchangeably.
///
/// Every method takes a deadline and a caller-supplied operation id; an
/// adapter must be idempotent per operation id, so a retried `allocate`
/// cannot double-allocate.
#[async_trait]
pub trait StrategyAdapter: Send + Sync {
    fn strategy_id(&self) -> &str;

    async fn allocate(
        &self,
        op_id: &str,
        payment_id: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<PositionRef, AdapterError>;

    async fn withdraw(
        &self,
        op_id: &str,
        position_ref: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<StrategySettlement, AdapterError>;

    async fn current_apy(&self, deadline: Instant) -> Result<u32, AdapterError>;

    async fn health(&self, deadline: Instant) -> Result<AdapterHealth, AdapterError>;
}

/// External protocol archetype behind a strategy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Tokenized treasury pool.
    TBill,
    /// Delta-neutral funding-rate vault.
    DeltaNeutral,
    /// Lending market supply position.
    Lending,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::TBill => "t_bill",
            StrategyKind::DeltaNeutral => "delta_neutral",
            StrategyKind::Lending => "lending",
        }
    }
}

/// Build the adapter set from configured endpoints.
pub fn build_adapters(
    endpoints: &[crate::config::StrategyEndpoint],
) -> anyhow::Result<Vec<std::sync::Arc<dyn StrategyAdapter>>> {
    let mut adapters: Vec<std::sync::Arc<dyn StrategyAdapter>> = Vec::new();
    for endpoint in endpoints {
        adapters.push(std::sync::Arc::new(http::HttpStrategyAdapter::new(
            &endpoint.id,
            endpoint.kind,
            &endpoint.base_url,
        )?));
    }
    Ok(adapters)
}
