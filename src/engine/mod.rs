pub mod accrual;
pub mod bridge;
pub mod clock;
pub mod lifecycle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::adapters::breaker::BreakerState;
use crate::adapters::{ApyCache, GuardedAdapter, GuardedError, RetryPolicy, StrategyAdapter};
use crate::chain::{AttestationClient, ChainClient, ChainEvent};
use crate::compliance::ComplianceChecker;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ledger::projection;
use crate::ledger::EventStore;
use crate::model::{
    Amount, EventKind, LedgerEvent, Payment, PaymentId, PaymentState, StrategyId,
    external_op_id,
};

use accrual::AccrualState;
use clock::Clock;

// ── Command/query surface types ──────────────────────────────────────

/// `CreatePayment` command payload. Also the transport request body.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreatePayment {
    pub user: String,
    pub merchant: String,
    pub principal: Amount,
    pub currency: String,
    pub source_chain: String,
    pub destination_chain: String,
    pub strategy_id: String,
    pub client_token: String,
}

/// Payment snapshot plus the accrual estimate at query time.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PaymentView {
    #[serde(flatten)]
    pub payment: Payment,
    pub current_accrued_yield: Amount,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct PaymentFilter {
    pub state: Option<PaymentState>,
    pub user: Option<String>,
    pub merchant: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PaymentPage {
    pub items: Vec<PaymentView>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct StrategyHealthView {
    pub strategy_id: StrategyId,
    pub healthy: bool,
    pub apy_bps: u32,
    pub last_probed_at: Option<DateTime<Utc>>,
    pub breaker_state: BreakerState,
}

/// External collaborators the engine is constructed over.
pub struct Collaborators {
    pub chains: Vec<Arc<dyn ChainClient>>,
    pub attestation: Arc<dyn AttestationClient>,
    pub adapters: Vec<Arc<dyn StrategyAdapter>>,
    pub compliance: Arc<dyn ComplianceChecker>,
    pub clock: Arc<dyn Clock>,
}

// ── Engine ───────────────────────────────────────────────────────────

/// The payment orchestration engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct PaymentEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: EventStore,
    /// Committed projection per payment. Queries read this lock-free.
    projections: DashMap<PaymentId, Payment>,
    /// Live accrual carry per accruing payment.
    accruals: DashMap<PaymentId, AccrualState>,
    /// Per-payment transition serialization.
    locks: DashMap<PaymentId, Arc<tokio::sync::Mutex<()>>>,
    pub(crate) adapters: HashMap<StrategyId, Arc<GuardedAdapter>>,
    pub(crate) chains: HashMap<String, Arc<dyn ChainClient>>,
    pub(crate) attestation: Arc<dyn AttestationClient>,
    compliance: Arc<dyn ComplianceChecker>,
    pub(crate) apy_cache: ApyCache,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) retry: RetryPolicy,
    admission: Semaphore,
}

impl PaymentEngine {
    /// Build the engine and rebuild the in-memory projection by folding the
    /// persisted event log.
    pub async fn new(
        config: EngineConfig,
        store: EventStore,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let apy_cache = crate::adapters::health::new_apy_cache();
        let mut adapters = HashMap::new();
        for adapter in collaborators.adapters {
            let id = adapter.strategy_id().to_string();
            let guarded = Arc::new(GuardedAdapter::new(
                adapter,
                &config,
                collaborators.clock.clone(),
                apy_cache.clone(),
            ));
            adapters.insert(id, guarded);
        }
        let mut chains = HashMap::new();
        for chain in collaborators.chains {
            chains.insert(chain.chain_id().to_string(), chain);
        }

        let admission = Semaphore::new(config.command_queue_depth);
        let inner = EngineInner {
            retry: RetryPolicy::from_config(&config),
            config,
            store,
            projections: DashMap::new(),
            accruals: DashMap::new(),
            locks: DashMap::new(),
            adapters,
            chains,
            attestation: collaborators.attestation,
            compliance: collaborators.compliance,
            apy_cache,
            clock: collaborators.clock,
            admission,
        };
        let engine = PaymentEngine { inner: Arc::new(inner) };
        engine.rebuild_projections().await?;
        Ok(engine)
    }

    /// Seed from the stored projection snapshots, then fold the event log
    /// over them; `apply` skips everything a snapshot already covers, so
    /// only the suffix written after the last snapshot does real work.
    async fn rebuild_projections(&self) -> Result<(), EngineError> {
        let mut rebuilt: HashMap<PaymentId, Payment> = self
            .inner
            .store
            .load_payments()
            .await?
            .into_iter()
            .map(|payment| (payment.id.clone(), payment))
            .collect();

        let events = self.inner.store.load_all_events().await?;
        let count = events.len();
        for event in events {
            let current = rebuilt.remove(&event.payment_id);
            let updated = projection::apply(current, &event)?;
            rebuilt.insert(event.payment_id, updated);
        }

        for payment in rebuilt.into_values() {
            self.finish_rebuild(payment);
        }
        tracing::info!(
            events = count,
            payments = self.inner.projections.len(),
            "ledger fold complete"
        );
        Ok(())
    }

    fn finish_rebuild(&self, payment: Payment) {
        if payment.state.is_accruing() {
            let last_at = payment
                .last_snapshot_at
                .or(payment.activated_at)
                .unwrap_or(payment.created_at);
            self.inner.accruals.insert(
                payment.id.clone(),
                AccrualState::restore(
                    payment.accrued_yield,
                    payment.last_apy_bps.unwrap_or(0),
                    last_at,
                ),
            );
        }
        self.inner.projections.insert(payment.id.clone(), payment);
    }

    /// Re-spawn drivers for payments that were mid-flight at shutdown.
    pub fn resume_in_flight(&self) {
        let pending: Vec<(PaymentId, PaymentState)> = self
            .inner
            .projections
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| (entry.id.clone(), entry.state))
            .collect();
        for (payment_id, state) in pending {
            let engine = self.clone();
            match state {
                PaymentState::Pending => {
                    tokio::spawn(async move { engine.activate(&payment_id).await });
                }
                PaymentState::Bridging => {
                    tokio::spawn(bridge::run(engine, payment_id));
                }
                PaymentState::Failing => {
                    tokio::spawn(async move {
                        if let Err(err) = engine.execute_refund(&payment_id).await {
                            tracing::warn!(payment = %payment_id, error = %err, "refund resume failed");
                        }
                    });
                }
                // Active payments accrue via the snapshot loop; Releasing is
                // picked up by the release pass.
                _ => {}
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub async fn create_payment(&self, cmd: CreatePayment) -> Result<PaymentId, EngineError> {
        let _permit =
            self.inner.admission.try_acquire().map_err(|_| EngineError::Overloaded)?;

        self.validate_create(&cmd)?;

        if let Some(hit) = self.replay_token(&cmd.client_token, "create").await? {
            return Ok(hit);
        }

        // Compliance screen happens before any event is written; a deny
        // leaves no trace of the payment.
        let verdict = self
            .inner
            .compliance
            .screen(&cmd.user, &cmd.merchant, cmd.principal, &cmd.currency)
            .await;
        if !verdict.allow {
            return Err(EngineError::ComplianceRejected {
                reason: verdict.reason.unwrap_or_else(|| "denied".into()),
            });
        }

        let payment_id = Uuid::new_v4().to_string();
        {
            let _guard = self.lock(&payment_id).await;
            let event = LedgerEvent {
                seq: 0,
                payment_id: payment_id.clone(),
                at: self.inner.clock.now(),
                kind: EventKind::Admitted {
                    user: cmd.user.clone(),
                    merchant: cmd.merchant.clone(),
                    principal: cmd.principal,
                    currency: cmd.currency.clone(),
                    source_chain: cmd.source_chain.clone(),
                    destination_chain: cmd.destination_chain.clone(),
                    strategy_id: cmd.strategy_id.clone(),
                },
            };
            let projected = projection::apply(None, &event)?;
            match self
                .inner
                .store
                .append_with_token(&event, &projected, &cmd.client_token, "create")
                .await
            {
                Ok(()) => {
                    self.inner.projections.insert(payment_id.clone(), projected);
                }
                Err(err) => {
                    // A concurrent admission with the same token may have won.
                    if let Some(hit) = self.replay_token(&cmd.client_token, "create").await? {
                        return Ok(hit);
                    }
                    return Err(err);
                }
            }
        }
        tracing::info!(payment = %payment_id, user = %cmd.user, merchant = %cmd.merchant, "payment admitted");

        // Drive the escrow deposit; failures surface on the payment state,
        // not on the admission result.
        self.activate(&payment_id).await;
        Ok(payment_id)
    }

    pub async fn release_payment(
        &self,
        payment_id: &str,
        caller: &str,
        client_token: &str,
    ) -> Result<PaymentView, EngineError> {
        if let Some(hit) = self.replay_token(client_token, "release").await? {
            // Idempotent re-submission: same snapshot, no new events.
            return self.get_payment(&hit);
        }

        let strategy_id;
        {
            let _guard = self.lock(payment_id).await;
            let payment = self.payment(payment_id)?;
            if payment.merchant != caller {
                return Err(EngineError::Unauthorized);
            }
            if payment.state != PaymentState::Active {
                return Err(EngineError::InvalidTransition {
                    payment_id: payment_id.to_string(),
                    state: payment.state,
                    command: "ReleasePayment",
                });
            }
            strategy_id = payment.strategy_id.clone();
            self.commit_with_token(
                payment_id,
                EventKind::ReleaseRequested { caller: caller.to_string() },
                client_token,
                "release",
            )
            .await?;
        }

        if !self.snapshot_fresh_enough(&strategy_id) {
            // Held in Releasing until the health loop produces fresh data;
            // the release pass completes the settlement then.
            tracing::warn!(payment = %payment_id, strategy = %strategy_id, "release held on stale strategy data");
            return Err(EngineError::AdapterUnavailable { strategy_id });
        }

        self.drive_settlement(payment_id).await?;
        self.get_payment(payment_id)
    }

    pub async fn cancel_payment(
        &self,
        payment_id: &str,
        caller: &str,
        client_token: &str,
    ) -> Result<PaymentView, EngineError> {
        if let Some(hit) = self.replay_token(client_token, "cancel").await? {
            return self.get_payment(&hit);
        }

        let _guard = self.lock(payment_id).await;
        let payment = self.payment(payment_id)?;
        if !payment.is_party(caller) {
            return Err(EngineError::Unauthorized);
        }
        if payment.state != PaymentState::Pending {
            return Err(EngineError::InvalidTransition {
                payment_id: payment_id.to_string(),
                state: payment.state,
                command: "CancelPayment",
            });
        }
        self.commit_with_token(
            payment_id,
            EventKind::Failed { reason: format!("cancelled by {caller}") },
            client_token,
            "cancel",
        )
        .await?;
        drop(_guard);
        self.get_payment(payment_id)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get_payment(&self, payment_id: &str) -> Result<PaymentView, EngineError> {
        let payment = self.payment(payment_id)?;
        let current_accrued_yield = if payment.state.is_accruing() {
            self.inner
                .accruals
                .get(payment_id)
                .map(|state| state.accrued_at(payment.principal, self.inner.clock.now()))
                .unwrap_or(payment.accrued_yield)
        } else {
            payment.accrued_yield
        };
        Ok(PaymentView { payment, current_accrued_yield })
    }

    pub fn list_payments(
        &self,
        filter: &PaymentFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> PaymentPage {
        let mut matching: Vec<Payment> = self
            .inner
            .projections
            .iter()
            .filter(|p| filter.state.is_none_or(|s| p.state == s))
            .filter(|p| filter.user.as_deref().is_none_or(|u| p.user == u))
            .filter(|p| filter.merchant.as_deref().is_none_or(|m| p.merchant == m))
            .map(|p| p.clone())
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let start = match cursor {
            Some(cursor_id) => matching
                .iter()
                .position(|p| p.id == cursor_id)
                .map(|pos| pos + 1)
                .unwrap_or(0),
            None => 0,
        };
        let limit = limit.clamp(1, 500);
        let end = (start + limit).min(matching.len());
        let next_cursor = if end < matching.len() {
            matching.get(end - 1).map(|p| p.id.clone())
        } else {
            None
        };

        let items = matching[start..end]
            .iter()
            .map(|payment| {
                self.get_payment(&payment.id).unwrap_or_else(|_| PaymentView {
                    current_accrued_yield: payment.accrued_yield,
                    payment: payment.clone(),
                })
            })
            .collect();
        PaymentPage { items, next_cursor }
    }

    pub fn strategy_health(&self, strategy_id: &str) -> Result<StrategyHealthView, EngineError> {
        let guard = self.adapter(strategy_id)?;
        let snapshot = self.inner.apy_cache.get(strategy_id);
        Ok(StrategyHealthView {
            strategy_id: strategy_id.to_string(),
            healthy: snapshot.as_ref().is_some_and(|s| s.healthy),
            apy_bps: snapshot.as_ref().map(|s| s.apy_bps).unwrap_or(0),
            last_probed_at: snapshot.map(|s| s.probed_at),
            breaker_state: guard.breaker_state(),
        })
    }

    /// Full event stream for a payment, oldest first.
    pub async fn events(&self, payment_id: &str) -> Result<Vec<LedgerEvent>, EngineError> {
        self.inner.store.load_events(payment_id).await
    }

    // ── Chain callbacks ──────────────────────────────────────────────

    /// Late or duplicate chain confirmations. Normal-path confirmations are
    /// consumed by the awaiting drivers; anything arriving here for a payment
    /// that moved on is recorded as a stale event. A bridge delivery racing a
    /// refund raises the reconciliation flag.
    pub async fn handle_chain_event(&self, event: ChainEvent) -> Result<(), EngineError> {
        let payment_id = event.payment_id().to_string();
        let _guard = self.lock(&payment_id).await;
        let payment = self.payment(&payment_id)?;

        let reconciliation = matches!(
            (&event, payment.state),
            (
                ChainEvent::BridgeDeliveryConfirmed { .. },
                PaymentState::Failing | PaymentState::Refunded | PaymentState::Failed
            )
        );
        self.commit(
            &payment_id,
            EventKind::StaleEvent { description: event.describe(), reconciliation },
        )
        .await?;

        if reconciliation {
            tracing::error!(
                payment = %payment_id,
                state = ?payment.state,
                "bridge delivery raced a refund; operator reconciliation required"
            );
            return Err(EngineError::DoubleSpendSuspected { payment_id });
        }
        Ok(())
    }

    // ── Activation ───────────────────────────────────────────────────

    pub(crate) async fn activate(&self, payment_id: &str) {
        if let Err(err) = self.try_activate(payment_id).await {
            tracing::warn!(payment = %payment_id, error = %err, "activation failed");
            let _guard = self.lock(payment_id).await;
            let state = self.payment(payment_id).map(|p| p.state);
            if matches!(state, Ok(PaymentState::Pending)) {
                let kind = EventKind::Failed { reason: format!("escrow deposit failed: {err}") };
                if let Err(commit_err) = self.commit(payment_id, kind).await {
                    tracing::error!(payment = %payment_id, error = %commit_err, "failed to record activation failure");
                }
            }
        }
    }

    async fn try_activate(&self, payment_id: &str) -> Result<(), EngineError> {
        let payment = self.payment(payment_id)?;
        let chain = self.chain(&payment.source_chain)?;
        let op_id = external_op_id(payment_id, payment.last_seq + 1);
        let deadline = self.deadline(self.inner.config.chain_timeout_secs);

        let escrow_ref = crate::adapters::retry::retry_transient(&self.inner.retry, deadline, || {
            let chain = chain.clone();
            let op_id = op_id.clone();
            let payment = payment.clone();
            async move {
                chain
                    .deposit(
                        &op_id,
                        &payment.user,
                        &payment.merchant,
                        payment.principal,
                        &payment.strategy_id,
                        deadline,
                    )
                    .await
            }
        })
        .await
        .map_err(|e| EngineError::Internal(format!("escrow deposit: {e}")))?;

        let updated = {
            let _guard = self.lock(payment_id).await;
            let current = self.payment(payment_id)?;
            if current.state != PaymentState::Pending {
                // Cancelled or force-failed while the deposit was in flight;
                // the funds are on-chain now, so send them back.
                self.commit(
                    payment_id,
                    EventKind::StaleEvent {
                        description: format!(
                            "escrow deposit {escrow_ref} confirmed in state {:?}",
                            current.state
                        ),
                        reconciliation: false,
                    },
                )
                .await?;
                drop(_guard);
                self.best_effort_refund(&payment.source_chain, payment_id, &escrow_ref).await;
                return Ok(());
            }
            self.commit(payment_id, EventKind::EscrowDeposited { escrow_ref }).await?
        };

        if updated.state == PaymentState::Bridging {
            tokio::spawn(bridge::run(self.clone(), payment_id.to_string()));
            return Ok(());
        }
        self.allocate_strategy(payment_id).await
    }

    /// Allocate the escrowed principal to the payment's strategy and start
    /// accrual. Used at activation and again after a bridge delivery.
    pub(crate) async fn allocate_strategy(&self, payment_id: &str) -> Result<(), EngineError> {
        let payment = self.payment(payment_id)?;
        let guard = self.adapter(&payment.strategy_id)?;
        let op_id = external_op_id(payment_id, payment.last_seq + 1);
        let deadline = self.deadline(self.inner.config.chain_timeout_secs);

        match guard.allocate(&op_id, payment_id, payment.principal, deadline).await {
            Ok(position_ref) => {
                let (apy_bps, stale) = match guard.apy_bps(deadline).await {
                    Ok((bps, cached)) => (bps, cached),
                    Err(_) => (0, true),
                };
                let _guard = self.lock(payment_id).await;
                self.commit(
                    payment_id,
                    EventKind::StrategyAllocated {
                        strategy_id: payment.strategy_id.clone(),
                        position_ref,
                    },
                )
                .await?;
                let now = self.inner.clock.now();
                self.inner
                    .accruals
                    .insert(payment_id.to_string(), AccrualState::new(now, apy_bps));
                self.commit(
                    payment_id,
                    EventKind::YieldSnapshot { apy_bps, accrued: Amount::ZERO, stale },
                )
                .await?;
                Ok(())
            }
            Err(GuardedError::Unavailable) => {
                self.enter_failing_and_refund(payment_id, "strategy allocation unavailable")
                    .await
            }
            Err(GuardedError::Permanent(msg)) => {
                self.enter_failing_and_refund(
                    payment_id,
                    &format!("strategy allocation rejected: {msg}"),
                )
                .await
            }
        }
    }

    // ── Settlement ───────────────────────────────────────────────────

    /// Drive a `Releasing` payment through distribution, withdrawal, and
    /// escrow release. Idempotent: a retry resumes where the previous
    /// attempt stopped, and the recorded distribution is never recomputed.
    pub(crate) async fn drive_settlement(&self, payment_id: &str) -> Result<(), EngineError> {
        let payment = {
            let _guard = self.lock(payment_id).await;
            let payment = self.payment(payment_id)?;
            if payment.state != PaymentState::Releasing {
                return Err(EngineError::InvalidTransition {
                    payment_id: payment_id.to_string(),
                    state: payment.state,
                    command: "Settlement",
                });
            }
            if payment.distribution.is_none() {
                // Freeze the yield with one final snapshot, then persist the
                // split before any settlement I/O.
                let now = self.inner.clock.now();
                let (apy_bps, stale) =
                    self.effective_apy(&payment.strategy_id, payment.last_apy_bps.unwrap_or(0));
                let accrued = {
                    let mut entry = self
                        .inner
                        .accruals
                        .entry(payment_id.to_string())
                        .or_insert_with(|| restored_accrual(&payment));
                    entry.observe(payment.principal, now, apy_bps)
                };
                self.commit(payment_id, EventKind::YieldSnapshot { apy_bps, accrued, stale })
                    .await?;
                let distribution =
                    accrual::split(accrued, &self.inner.config.distribution_policy);
                self.commit(payment_id, EventKind::DistributionComputed { distribution })
                    .await?;
            }
            self.payment(payment_id)?
        };

        // Withdraw the position from the strategy.
        if let Some(position_ref) = payment.position_ref.clone() {
            let guard = self.adapter(&payment.strategy_id)?;
            let op_id = external_op_id(payment_id, payment.last_seq + 1);
            let total = payment
                .principal
                .checked_add(payment.accrued_yield)
                .ok_or_else(|| EngineError::Internal("withdrawal amount overflow".into()))?;
            let deadline = self.deadline(self.inner.config.chain_timeout_secs);
            match guard.withdraw(&op_id, &position_ref, total, deadline).await {
                Ok(settlement) => {
                    tracing::debug!(payment = %payment_id, reference = %settlement.reference, "strategy position withdrawn");
                }
                Err(GuardedError::Unavailable) => {
                    return Err(EngineError::AdapterUnavailable {
                        strategy_id: payment.strategy_id.clone(),
                    });
                }
                Err(GuardedError::Permanent(msg)) => {
                    // Funds stay in the strategy; hold the payment in
                    // Releasing for the release pass / an operator retry.
                    tracing::error!(payment = %payment_id, error = %msg, "strategy withdrawal rejected");
                    return Err(EngineError::AdapterUnavailable {
                        strategy_id: payment.strategy_id.clone(),
                    });
                }
            }
        }

        // Release the escrow with the recorded split.
        let distribution = payment
            .distribution
            .ok_or_else(|| EngineError::Internal("distribution missing at settlement".into()))?;
        let (chain, escrow_ref) = self.settlement_target(&payment)?;
        let op_id = external_op_id(payment_id, payment.last_seq + 1);
        let deadline = self.deadline(self.inner.config.chain_timeout_secs);
        let tx_ref = crate::adapters::retry::retry_transient(&self.inner.retry, deadline, || {
            let chain = chain.clone();
            let op_id = op_id.clone();
            let escrow_ref = escrow_ref.clone();
            async move {
                chain
                    .release(&op_id, &escrow_ref, payment.principal, &distribution, deadline)
                    .await
            }
        })
        .await
        .map_err(|e| match e {
            crate::chain::ChainError::Rejected(msg) => {
                EngineError::Internal(format!("escrow release rejected: {msg}"))
            }
            crate::chain::ChainError::Transient(_) => EngineError::AdapterUnavailable {
                strategy_id: payment.strategy_id.clone(),
            },
        })?;

        {
            let _guard = self.lock(payment_id).await;
            let current = self.payment(payment_id)?;
            if current.state != PaymentState::Releasing {
                // A concurrent settlement attempt won the race.
                return Ok(());
            }
            self.commit(payment_id, EventKind::SettlementSubmitted { tx_ref: tx_ref.clone() })
                .await?;
            self.commit(payment_id, EventKind::SettlementConfirmed { tx_ref }).await?;
        }
        self.inner.accruals.remove(payment_id);
        tracing::info!(payment = %payment_id, "payment completed");
        Ok(())
    }

    fn settlement_target(
        &self,
        payment: &Payment,
    ) -> Result<(Arc<dyn ChainClient>, String), EngineError> {
        if let Some(escrow) = &payment.destination_escrow_ref {
            return Ok((self.chain(&payment.destination_chain)?, escrow.clone()));
        }
        let escrow = payment
            .escrow_ref
            .clone()
            .ok_or_else(|| EngineError::Internal("settlement without an escrow".into()))?;
        Ok((self.chain(&payment.source_chain)?, escrow))
    }

    // ── Failure path ─────────────────────────────────────────────────

    pub(crate) async fn enter_failing_and_refund(
        &self,
        payment_id: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        {
            let _guard = self.lock(payment_id).await;
            let payment = self.payment(payment_id)?;
            match payment.state {
                PaymentState::Active | PaymentState::Bridging => {
                    self.commit(
                        payment_id,
                        EventKind::RefundRequested { reason: reason.to_string() },
                    )
                    .await?;
                }
                PaymentState::Failing => {}
                state => {
                    tracing::debug!(payment = %payment_id, ?state, "refund request ignored");
                    return Ok(());
                }
            }
        }
        self.execute_refund(payment_id).await
    }

    pub(crate) async fn execute_refund(&self, payment_id: &str) -> Result<(), EngineError> {
        let payment = self.payment(payment_id)?;
        if payment.state != PaymentState::Failing {
            return Ok(());
        }
        if payment.reconciliation_required {
            // A bridge delivery landed while the refund was pending; moving
            // funds now could pay both sides. Hold for the operator.
            tracing::error!(payment = %payment_id, "refund halted pending reconciliation");
            return Err(EngineError::DoubleSpendSuspected {
                payment_id: payment_id.to_string(),
            });
        }

        let (chain, escrow_ref) = match &payment.destination_escrow_ref {
            Some(escrow) => (self.chain(&payment.destination_chain)?, escrow.clone()),
            None => match &payment.escrow_ref {
                Some(escrow) => (self.chain(&payment.source_chain)?, escrow.clone()),
                None => {
                    let _guard = self.lock(payment_id).await;
                    self.commit(
                        payment_id,
                        EventKind::Failed { reason: "no escrow to refund".into() },
                    )
                    .await?;
                    return Ok(());
                }
            },
        };

        let op_id = external_op_id(payment_id, payment.last_seq + 1);
        let deadline = self.deadline(self.inner.config.chain_timeout_secs);
        let refunded = crate::adapters::retry::retry_transient(&self.inner.retry, deadline, || {
            let chain = chain.clone();
            let op_id = op_id.clone();
            let escrow_ref = escrow_ref.clone();
            async move { chain.refund(&op_id, &escrow_ref, deadline).await }
        })
        .await;

        let _guard = self.lock(payment_id).await;
        let current = self.payment(payment_id)?;
        if current.state != PaymentState::Failing {
            return Ok(());
        }
        match refunded {
            Ok(tx_ref) => {
                self.commit(payment_id, EventKind::RefundConfirmed { tx_ref }).await?;
            }
            Err(err) => {
                self.commit(
                    payment_id,
                    EventKind::Failed { reason: format!("refund exhausted retries: {err}") },
                )
                .await?;
            }
        }
        self.inner.accruals.remove(payment_id);
        Ok(())
    }

    async fn best_effort_refund(&self, chain_id: &str, payment_id: &str, escrow_ref: &str) {
        let Ok(chain) = self.chain(chain_id) else { return };
        let op_id = external_op_id(payment_id, u64::MAX);
        let deadline = self.deadline(self.inner.config.chain_timeout_secs);
        match chain.refund(&op_id, escrow_ref, deadline).await {
            Ok(tx_ref) => {
                tracing::info!(payment = %payment_id, tx = %tx_ref, "late escrow deposit refunded");
            }
            Err(err) => {
                tracing::error!(payment = %payment_id, escrow = %escrow_ref, error = %err, "late escrow refund failed; operator attention required");
            }
        }
    }

    // ── Background passes ────────────────────────────────────────────

    /// Snapshot accrual for every accruing payment.
    pub async fn run_snapshot_pass(&self) {
        let now = self.inner.clock.now();
        let accruing: Vec<PaymentId> = self
            .inner
            .projections
            .iter()
            .filter(|p| p.state.is_accruing())
            .map(|p| p.id.clone())
            .collect();

        for payment_id in accruing {
            let _guard = self.lock(&payment_id).await;
            let Ok(payment) = self.payment(&payment_id) else { continue };
            if !payment.state.is_accruing() {
                continue;
            }
            let (apy_bps, stale) =
                self.effective_apy(&payment.strategy_id, payment.last_apy_bps.unwrap_or(0));
            let accrued = {
                let mut entry = self
                    .inner
                    .accruals
                    .entry(payment_id.clone())
                    .or_insert_with(|| restored_accrual(&payment));
                entry.observe(payment.principal, now, apy_bps)
            };
            if let Err(err) = self
                .commit(&payment_id, EventKind::YieldSnapshot { apy_bps, accrued, stale })
                .await
            {
                tracing::error!(payment = %payment_id, error = %err, "yield snapshot failed");
            }
        }
    }

    /// Complete settlements that were held on stale data or interrupted.
    pub async fn run_release_pass(&self) {
        let releasing: Vec<(PaymentId, StrategyId, bool)> = self
            .inner
            .projections
            .iter()
            .filter(|p| p.state == PaymentState::Releasing)
            .map(|p| (p.id.clone(), p.strategy_id.clone(), p.distribution.is_some()))
            .collect();

        for (payment_id, strategy_id, distribution_computed) in releasing {
            if !distribution_computed && !self.snapshot_fresh_enough(&strategy_id) {
                continue;
            }
            if let Err(err) = self.drive_settlement(&payment_id).await {
                tracing::warn!(payment = %payment_id, error = %err, "release retry failed");
            }
        }
    }

    /// Force-fail payments stuck past the abandonment horizon.
    pub async fn run_abandonment_pass(&self) {
        let now = self.inner.clock.now();
        let horizon = chrono::Duration::seconds(self.inner.config.abandonment_horizon_secs as i64);
        let stuck: Vec<(PaymentId, PaymentState)> = self
            .inner
            .projections
            .iter()
            .filter(|p| !p.state.is_terminal() && now - p.created_at > horizon)
            .map(|p| (p.id.clone(), p.state))
            .collect();

        for (payment_id, state) in stuck {
            tracing::warn!(payment = %payment_id, ?state, "abandonment horizon elapsed");
            let result = match state {
                PaymentState::Pending => {
                    let _guard = self.lock(&payment_id).await;
                    match self.payment(&payment_id).map(|p| p.state) {
                        Ok(PaymentState::Pending) => self
                            .commit(
                                &payment_id,
                                EventKind::Failed { reason: "abandonment horizon elapsed".into() },
                            )
                            .await
                            .map(|_| ()),
                        _ => Ok(()),
                    }
                }
                PaymentState::Active | PaymentState::Bridging => {
                    self.enter_failing_and_refund(&payment_id, "abandonment horizon elapsed").await
                }
                PaymentState::Failing => self.execute_refund(&payment_id).await,
                // Releasing/Released settle through the release pass.
                _ => Ok(()),
            };
            if let Err(err) = result {
                tracing::warn!(payment = %payment_id, error = %err, "abandonment sweep failed");
            }
        }
    }

    /// Probe every adapter. Returns true when any cached APY changed.
    pub async fn run_health_pass(&self) -> bool {
        crate::adapters::health::run_health_pass(
            &self.inner.adapters,
            Duration::from_secs(self.inner.config.chain_timeout_secs),
        )
        .await
    }

    /// Spawn the snapshot/health/sweep loops. They stop when `shutdown`
    /// flips to true.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.resume_in_flight();
        let mut handles = Vec::new();

        {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    engine.inner.config.snapshot_interval_secs.max(1),
                ));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            engine.run_snapshot_pass().await;
                            engine.run_release_pass().await;
                            engine.run_abandonment_pass().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    engine.inner.config.health_interval_secs.max(1),
                ));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            // An APY change snapshots immediately instead of
                            // waiting out the accrual cadence.
                            if engine.run_health_pass().await {
                                engine.run_snapshot_pass().await;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        handles
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn lock(&self, payment_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self
            .inner
            .locks
            .entry(payment_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    pub(crate) fn payment(&self, payment_id: &str) -> Result<Payment, EngineError> {
        self.inner
            .projections
            .get(payment_id)
            .map(|p| p.clone())
            .ok_or_else(|| EngineError::InvalidParameters(format!("unknown payment {payment_id}")))
    }

    pub(crate) fn adapter(&self, strategy_id: &str) -> Result<Arc<GuardedAdapter>, EngineError> {
        self.inner
            .adapters
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidParameters(format!("unknown strategy {strategy_id}")))
    }

    pub(crate) fn chain(&self, chain_id: &str) -> Result<Arc<dyn ChainClient>, EngineError> {
        self.inner
            .chains
            .get(chain_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidParameters(format!("unknown chain {chain_id}")))
    }

    pub(crate) fn deadline(&self, secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    /// Append `kind` under the caller-held payment lock and refresh the
    /// committed projection.
    pub(crate) async fn commit(
        &self,
        payment_id: &str,
        kind: EventKind,
    ) -> Result<Payment, EngineError> {
        let current = self.inner.projections.get(payment_id).map(|p| p.clone());
        let seq = current.as_ref().map(|p| p.last_seq + 1).unwrap_or(0);
        let event = LedgerEvent {
            seq,
            payment_id: payment_id.to_string(),
            at: self.inner.clock.now(),
            kind,
        };
        let updated = projection::apply(current, &event)?;
        self.inner.store.append(&event, &updated).await?;
        self.inner.projections.insert(payment_id.to_string(), updated.clone());
        tracing::debug!(
            payment = %payment_id,
            seq,
            kind = event.kind.name(),
            state = ?updated.state,
            "ledger event"
        );
        Ok(updated)
    }

    async fn commit_with_token(
        &self,
        payment_id: &str,
        kind: EventKind,
        token: &str,
        command_kind: &str,
    ) -> Result<Payment, EngineError> {
        let current = self.inner.projections.get(payment_id).map(|p| p.clone());
        let seq = current.as_ref().map(|p| p.last_seq + 1).unwrap_or(0);
        let event = LedgerEvent {
            seq,
            payment_id: payment_id.to_string(),
            at: self.inner.clock.now(),
            kind,
        };
        let updated = projection::apply(current, &event)?;
        self.inner.store.append_with_token(&event, &updated, token, command_kind).await?;
        self.inner.projections.insert(payment_id.to_string(), updated.clone());
        Ok(updated)
    }

    /// Resolve a client token replay: `Ok(Some(payment))` when the same
    /// command was already accepted, `Duplicate` when the token belongs to a
    /// different command kind.
    async fn replay_token(
        &self,
        token: &str,
        command_kind: &str,
    ) -> Result<Option<PaymentId>, EngineError> {
        match self.inner.store.lookup_token_any_kind(token).await? {
            Some((kind, payment_id)) if kind == command_kind => {
                tracing::debug!(payment = %payment_id, command = command_kind, "client token replay");
                Ok(Some(payment_id))
            }
            Some((_, payment_id)) => Err(EngineError::Duplicate { payment_id }),
            None => Ok(None),
        }
    }

    fn validate_create(&self, cmd: &CreatePayment) -> Result<(), EngineError> {
        if !cmd.principal.is_positive() {
            return Err(EngineError::InvalidParameters("principal must be positive".into()));
        }
        for (field, value) in [
            ("user", &cmd.user),
            ("merchant", &cmd.merchant),
            ("currency", &cmd.currency),
            ("client_token", &cmd.client_token),
        ] {
            if value.is_empty() {
                return Err(EngineError::InvalidParameters(format!("{field} is required")));
            }
        }
        if cmd.user == cmd.merchant {
            return Err(EngineError::InvalidParameters(
                "user and merchant must be distinct parties".into(),
            ));
        }
        if !self.inner.adapters.contains_key(&cmd.strategy_id) {
            return Err(EngineError::InvalidParameters(format!(
                "unknown strategy {}",
                cmd.strategy_id
            )));
        }
        for chain in [&cmd.source_chain, &cmd.destination_chain] {
            if !self.inner.chains.contains_key(chain) {
                return Err(EngineError::InvalidParameters(format!("unknown chain {chain}")));
            }
        }
        Ok(())
    }

    /// APY to accrue under right now, from the shared snapshot cache. Data
    /// older than `stale_after` or from an unhealthy strategy keeps accruing
    /// at the last known value, flagged stale.
    fn effective_apy(&self, strategy_id: &str, fallback_bps: u32) -> (u32, bool) {
        let now = self.inner.clock.now();
        match self.inner.apy_cache.get(strategy_id) {
            Some(snapshot) => {
                let stale = !snapshot.healthy
                    || snapshot.age_secs(now) > self.inner.config.stale_after_secs;
                (snapshot.apy_bps, stale)
            }
            None => (fallback_bps, true),
        }
    }

    /// Whether strategy data is fresh enough to release on.
    fn snapshot_fresh_enough(&self, strategy_id: &str) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .apy_cache
            .get(strategy_id)
            .is_some_and(|s| s.age_secs(now) <= self.inner.config.max_stale_interval_secs)
    }
}

fn restored_accrual(payment: &Payment) -> AccrualState {
    let last_at = payment
        .last_snapshot_at
        .or(payment.activated_at)
        .unwrap_or(payment.created_at);
    AccrualState::restore(payment.accrued_yield, payment.last_apy_bps.unwrap_or(0), last_at)
}
