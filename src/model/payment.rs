use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::amount::Amount;
use super::chain::{ChainId, EscrowRef, PositionRef, TxRef};

/// A unique identifier for a payment, platform-wide.
pub type PaymentId = String;

/// Identifier of a registered yield strategy.
pub type StrategyId = String;

/// User or merchant identifier.
pub type PartyId = String;

/// Lifecycle state of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum PaymentState {
    /// Admitted, escrow deposit not yet confirmed.
    Pending,
    /// Principal escrowed and allocated; yield is accruing.
    Active,
    /// Release accepted; distribution and settlement in flight.
    Releasing,
    /// Settlement and distribution submitted on-chain.
    Released,
    /// Source-chain escrow confirmed, cross-chain transfer in flight.
    Bridging,
    /// Settlement confirmed. Terminal.
    Completed,
    /// Failure detected; refund in flight.
    Failing,
    /// Refund confirmed. Terminal.
    Refunded,
    /// Unrecoverable failure. Terminal.
    Failed,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Refunded | PaymentState::Failed)
    }

    /// States in which yield accrues.
    pub fn is_accruing(&self) -> bool {
        matches!(self, PaymentState::Active)
    }
}

/// The computed yield split, recorded at release and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Distribution {
    pub user_yield: Amount,
    pub merchant_yield: Amount,
    pub protocol_yield: Amount,
}

impl Distribution {
    pub fn total(&self) -> Amount {
        Amount::from_micros(
            self.user_yield.micros() + self.merchant_yield.micros() + self.protocol_yield.micros(),
        )
    }
}

/// The payment aggregate. Mutated only by the engine, as the fold of the
/// payment's ledger events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Payment {
    pub id: PaymentId,
    pub user: PartyId,
    pub merchant: PartyId,
    pub principal: Amount,
    pub currency: String,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub strategy_id: StrategyId,
    pub state: PaymentState,

    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,

    /// Frozen at release; monotonically non-decreasing while `Active`.
    pub accrued_yield: Amount,
    pub distribution: Option<Distribution>,

    pub escrow_ref: Option<EscrowRef>,
    /// Escrow minted on the destination chain for cross-chain payments.
    pub destination_escrow_ref: Option<EscrowRef>,
    pub position_ref: Option<PositionRef>,
    /// Burn transaction on the source chain, for cross-chain payments.
    pub bridge_ref: Option<TxRef>,
    /// Quoted bridge fee + gas, persisted before the burn is submitted.
    pub bridge_quote: Option<Amount>,
    /// Validator signature over the burn, recorded at attestation.
    pub bridge_attestation: Option<String>,

    pub settlement_tx: Option<TxRef>,
    pub refund_tx: Option<TxRef>,
    pub failure_reason: Option<String>,
    /// Set when a bridge delivery landed after a refund was submitted and an
    /// operator has to reconcile the two legs.
    pub reconciliation_required: bool,

    /// Sequence number of the last applied ledger event.
    pub last_seq: u64,
    /// APY in effect at the most recent yield snapshot.
    pub last_apy_bps: Option<u32>,
    /// Instant of the most recent yield snapshot.
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn is_cross_chain(&self) -> bool {
        self.source_chain != self.destination_chain
    }

    /// Whether `party` is the user or merchant of record.
    pub fn is_party(&self, party: &str) -> bool {
        self.user == party || self.merchant == party
    }
}
