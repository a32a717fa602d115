use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::amount::Amount;
use super::chain::{ChainId, EscrowRef, PositionRef, TxRef};
use super::payment::{Distribution, PaymentId, PartyId, StrategyId};

/// One immutable record in a payment's append-only event log.
///
/// `seq` is dense and starts at 0 per payment; the current `Payment` is the
/// deterministic fold of its events in `seq` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LedgerEvent {
    pub seq: u64,
    pub payment_id: PaymentId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum EventKind {
    /// Command admitted after the compliance screen. Always `seq` 0.
    Admitted {
        user: PartyId,
        merchant: PartyId,
        principal: Amount,
        currency: String,
        source_chain: ChainId,
        destination_chain: ChainId,
        strategy_id: StrategyId,
    },
    /// Escrow deposit confirmed on the source chain.
    EscrowDeposited { escrow_ref: EscrowRef },
    /// Principal allocated to a strategy (at admission, or re-allocated on
    /// the destination chain after a bridge delivery).
    StrategyAllocated {
        strategy_id: StrategyId,
        position_ref: PositionRef,
    },
    /// Periodic accrual observation. `stale` marks snapshots taken on APY
    /// data older than the configured tolerance or from an unhealthy strategy.
    YieldSnapshot {
        apy_bps: u32,
        accrued: Amount,
        stale: bool,
    },
    /// Merchant-authorized release accepted.
    ReleaseRequested { caller: PartyId },
    /// Yield split frozen. Persisted before any settlement submission so a
    /// retry or crash cannot change the computed split.
    DistributionComputed { distribution: Distribution },
    SettlementSubmitted { tx_ref: TxRef },
    SettlementConfirmed { tx_ref: TxRef },
    /// Burn submitted on the source chain.
    BridgeInitiated { burn_tx: TxRef, quote: Amount },
    /// Validator consensus reached.
    BridgeAttested { signature: String },
    /// Mint confirmed on the destination chain.
    BridgeDelivered {
        mint_escrow_ref: EscrowRef,
        destination_chain: ChainId,
    },
    RefundRequested { reason: String },
    RefundConfirmed { tx_ref: TxRef },
    Failed { reason: String },
    /// A chain or adapter callback that arrived for a payment past the state
    /// it applies to. Recorded, never folded into state. `reconciliation`
    /// flags a bridge delivery that raced a refund (double-spend suspect).
    StaleEvent {
        description: String,
        reconciliation: bool,
    },
}

impl EventKind {
    /// Stable discriminant name, used as the `kind` column in the store.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Admitted { .. } => "Admitted",
            EventKind::EscrowDeposited { .. } => "EscrowDeposited",
            EventKind::StrategyAllocated { .. } => "StrategyAllocated",
            EventKind::YieldSnapshot { .. } => "YieldSnapshot",
            EventKind::ReleaseRequested { .. } => "ReleaseRequested",
            EventKind::DistributionComputed { .. } => "DistributionComputed",
            EventKind::SettlementSubmitted { .. } => "SettlementSubmitted",
            EventKind::SettlementConfirmed { .. } => "SettlementConfirmed",
            EventKind::BridgeInitiated { .. } => "BridgeInitiated",
            EventKind::BridgeAttested { .. } => "BridgeAttested",
            EventKind::BridgeDelivered { .. } => "BridgeDelivered",
            EventKind::RefundRequested { .. } => "RefundRequested",
            EventKind::RefundConfirmed { .. } => "RefundConfirmed",
            EventKind::Failed { .. } => "Failed",
            EventKind::StaleEvent { .. } => "StaleEvent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_round_trips_through_json() {
        let event = LedgerEvent {
            seq: 7,
            payment_id: "pay-1".into(),
            at: "2026-01-01T00:00:00Z".parse().unwrap(),
            kind: EventKind::YieldSnapshot {
                apy_bps: 400,
                accrued: Amount::from_micros(40_000),
                stale: false,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"YieldSnapshot\""));
        let back: LedgerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
