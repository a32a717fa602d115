use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::model::{Amount, Distribution, EscrowRef, TxRef};

use super::{AttestationClient, AttestationStatus, ChainClient, ChainError};

/// Scriptable in-memory chain for the demo command and the integration
/// tests. Confirms instantly unless told to fail.
pub struct MockChainClient {
    id: String,
    counter: AtomicU64,
    fail_next_deposits: AtomicU32,
    fail_next_refunds: AtomicU32,
    reject_deposits: RwLock<Option<String>>,
    deposit_delay: RwLock<Duration>,
    bridge_fee: RwLock<Amount>,
    /// Idempotency per operation id.
    escrows: DashMap<String, EscrowRef>,
    refunds: RwLock<Vec<(EscrowRef, TxRef)>>,
    releases: RwLock<Vec<(EscrowRef, Distribution)>>,
}

impl MockChainClient {
    pub fn new(id: &str) -> Self {
        MockChainClient {
            id: id.to_string(),
            counter: AtomicU64::new(0),
            fail_next_deposits: AtomicU32::new(0),
            fail_next_refunds: AtomicU32::new(0),
            reject_deposits: RwLock::new(None),
            deposit_delay: RwLock::new(Duration::ZERO),
            bridge_fee: RwLock::new(Amount::from_micros(2_500_000)),
            escrows: DashMap::new(),
            refunds: RwLock::new(Vec::new()),
            releases: RwLock::new(Vec::new()),
        }
    }

    pub fn fail_next_deposits(&self, n: u32) {
        self.fail_next_deposits.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_refunds(&self, n: u32) {
        self.fail_next_refunds.store(n, Ordering::SeqCst);
    }

    /// Reject (permanently) every deposit with the given reason.
    pub fn reject_deposits(&self, reason: Option<String>) {
        *self.reject_deposits.write() = reason;
    }

    /// Delay deposit confirmations, opening a window to observe `Pending`.
    pub fn set_deposit_delay(&self, delay: Duration) {
        *self.deposit_delay.write() = delay;
    }

    pub fn set_bridge_fee(&self, fee: Amount) {
        *self.bridge_fee.write() = fee;
    }

    pub fn refunds(&self) -> Vec<(EscrowRef, TxRef)> {
        self.refunds.read().clone()
    }

    pub fn releases(&self) -> Vec<(EscrowRef, Distribution)> {
        self.releases.read().clone()
    }

    fn next_ref(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{prefix}-{n}", self.id)
    }

    fn take_failure(&self, counter: &AtomicU32) -> bool {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return true;
        }
        false
    }
}

#[async_trait::async_trait]
impl ChainClient for MockChainClient {
    fn chain_id(&self) -> &str {
        &self.id
    }

    async fn deposit(
        &self,
        op_id: &str,
        _user: &str,
        _merchant: &str,
        _amount: Amount,
        _strategy_tag: &str,
        _deadline: Instant,
    ) -> Result<EscrowRef, ChainError> {
        let delay = *self.deposit_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.reject_deposits.read().clone() {
            return Err(ChainError::Rejected(reason));
        }
        if self.take_failure(&self.fail_next_deposits) {
            return Err(ChainError::Transient("injected deposit failure".into()));
        }
        let escrow = self
            .escrows
            .entry(op_id.to_string())
            .or_insert_with(|| self.next_ref("esc"))
            .clone();
        Ok(escrow)
    }

    async fn release(
        &self,
        _op_id: &str,
        escrow_ref: &str,
        _principal: Amount,
        distribution: &Distribution,
        _deadline: Instant,
    ) -> Result<TxRef, ChainError> {
        self.releases.write().push((escrow_ref.to_string(), *distribution));
        Ok(self.next_ref("release"))
    }

    async fn refund(
        &self,
        _op_id: &str,
        escrow_ref: &str,
        _deadline: Instant,
    ) -> Result<TxRef, ChainError> {
        if self.take_failure(&self.fail_next_refunds) {
            return Err(ChainError::Transient("injected refund failure".into()));
        }
        let tx = self.next_ref("refund");
        self.refunds.write().push((escrow_ref.to_string(), tx.clone()));
        Ok(tx)
    }

    async fn quote_bridge(&self, _destination: &str, _amount: Amount) -> Result<Amount, ChainError> {
        Ok(*self.bridge_fee.read())
    }

    async fn burn_for_bridge(
        &self,
        op_id: &str,
        _escrow_ref: &str,
        _destination: &str,
        _deadline: Instant,
    ) -> Result<TxRef, ChainError> {
        let tx = self
            .escrows
            .entry(format!("burn:{op_id}"))
            .or_insert_with(|| self.next_ref("burn"))
            .clone();
        Ok(tx)
    }

    async fn mint_from_bridge(
        &self,
        op_id: &str,
        _burn_tx: &str,
        _attestation: &str,
        _user: &str,
        _merchant: &str,
        _amount: Amount,
        _deadline: Instant,
    ) -> Result<EscrowRef, ChainError> {
        let escrow = self
            .escrows
            .entry(format!("mint:{op_id}"))
            .or_insert_with(|| self.next_ref("esc"))
            .clone();
        Ok(escrow)
    }
}

/// Attestation service that becomes ready after a configurable number of
/// polls, or never.
pub struct MockAttestationClient {
    ready_after_polls: AtomicU32,
    never_ready: parking_lot::RwLock<bool>,
    polls: AtomicU32,
}

impl MockAttestationClient {
    pub fn ready_after(polls: u32) -> Self {
        MockAttestationClient {
            ready_after_polls: AtomicU32::new(polls),
            never_ready: parking_lot::RwLock::new(false),
            polls: AtomicU32::new(0),
        }
    }

    pub fn never() -> Self {
        let client = Self::ready_after(0);
        *client.never_ready.write() = true;
        client
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AttestationClient for MockAttestationClient {
    async fn get_attestation(
        &self,
        burn_tx: &str,
        _deadline: Instant,
    ) -> Result<AttestationStatus, ChainError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.never_ready.read() || polls <= self.ready_after_polls.load(Ordering::SeqCst) {
            return Ok(AttestationStatus { ready: false, signature: None });
        }
        Ok(AttestationStatus {
            ready: true,
            signature: Some(format!("attestation:{burn_tx}")),
        })
    }
}
