pub mod mock;
pub mod relayer;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::adapters::Retryable;
use crate::model::{Amount, Distribution, EscrowRef, PaymentId, TxRef};

/// Failure classification for chain and attestation calls.
#[derive(Error, Debug)]
pub enum ChainError {
    /// The chain (or escrow contract) rejected the transaction.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Network-level failure; safe to retry under the same operation id.
    #[error("transient: {0}")]
    Transient(String),
}

impl Retryable for ChainError {
    fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

/// Escrow and bridge operations on one chain. Implementations submit the
/// transaction, wait for its confirmation event, and return the confirmed
/// reference; every method takes a deadline and an operation id it must
/// round-trip for idempotent correlation.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> &str;

    /// `deposit(user, merchant, amount, strategyTag)` on the escrow contract.
    async fn deposit(
        &self,
        op_id: &str,
        user: &str,
        merchant: &str,
        amount: Amount,
        strategy_tag: &str,
        deadline: Instant,
    ) -> Result<EscrowRef, ChainError>;

    /// `release(escrowRef, distribution)`: principal to the merchant plus the
    /// computed yield split.
    async fn release(
        &self,
        op_id: &str,
        escrow_ref: &str,
        principal: Amount,
        distribution: &Distribution,
        deadline: Instant,
    ) -> Result<TxRef, ChainError>;

    /// `refund(escrowRef)`: principal and any held yield back to the user.
    async fn refund(
        &self,
        op_id: &str,
        escrow_ref: &str,
        deadline: Instant,
    ) -> Result<TxRef, ChainError>;

    /// Total bridge cost (fee + gas estimate) towards `destination`.
    async fn quote_bridge(
        &self,
        destination: &str,
        amount: Amount,
    ) -> Result<Amount, ChainError>;

    /// Burn the escrowed principal for bridging towards `destination`.
    async fn burn_for_bridge(
        &self,
        op_id: &str,
        escrow_ref: &str,
        destination: &str,
        deadline: Instant,
    ) -> Result<TxRef, ChainError>;

    /// Mint on this chain against an attested burn, re-escrowing the funds.
    async fn mint_from_bridge(
        &self,
        op_id: &str,
        burn_tx: &str,
        attestation: &str,
        user: &str,
        merchant: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<EscrowRef, ChainError>;
}

/// Validator-consensus attestation over a source-chain burn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationStatus {
    pub ready: bool,
    pub signature: Option<String>,
}

#[async_trait]
pub trait AttestationClient: Send + Sync {
    async fn get_attestation(
        &self,
        burn_tx: &str,
        deadline: Instant,
    ) -> Result<AttestationStatus, ChainError>;
}

/// Chain callbacks delivered to the engine outside its own awaited calls:
/// duplicate confirmations, or confirmations that arrive after the payment
/// moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    DepositConfirmed { payment_id: PaymentId, escrow_ref: EscrowRef },
    ReleaseConfirmed { payment_id: PaymentId, tx_ref: TxRef },
    RefundConfirmed { payment_id: PaymentId, tx_ref: TxRef },
    BridgeDeliveryConfirmed { payment_id: PaymentId, escrow_ref: EscrowRef },
}

impl ChainEvent {
    pub fn payment_id(&self) -> &str {
        match self {
            ChainEvent::DepositConfirmed { payment_id, .. }
            | ChainEvent::ReleaseConfirmed { payment_id, .. }
            | ChainEvent::RefundConfirmed { payment_id, .. }
            | ChainEvent::BridgeDeliveryConfirmed { payment_id, .. } => payment_id,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ChainEvent::DepositConfirmed { escrow_ref, .. } => {
                format!("deposit confirmed for escrow {escrow_ref}")
            }
            ChainEvent::ReleaseConfirmed { tx_ref, .. } => {
                format!("release confirmed in {tx_ref}")
            }
            ChainEvent::RefundConfirmed { tx_ref, .. } => {
                format!("refund confirmed in {tx_ref}")
            }
            ChainEvent::BridgeDeliveryConfirmed { escrow_ref, .. } => {
                format!("bridge delivery confirmed for escrow {escrow_ref}")
            }
        }
    }
}

/// Build chain clients from configured relayer endpoints.
pub fn build_chains(
    endpoints: &[crate::config::ChainEndpoint],
) -> anyhow::Result<Vec<std::sync::Arc<dyn ChainClient>>> {
    let mut chains: Vec<std::sync::Arc<dyn ChainClient>> = Vec::new();
    for endpoint in endpoints {
        chains.push(std::sync::Arc::new(relayer::HttpChainClient::new(
            &endpoint.id,
            &endpoint.base_url,
        )?));
    }
    Ok(chains)
}
