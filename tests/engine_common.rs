#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use yield_rails::adapters::mock::MockStrategy;
use yield_rails::chain::ChainClient;
use yield_rails::chain::mock::{MockAttestationClient, MockChainClient};
use yield_rails::compliance::{AllowAll, ComplianceChecker};
use yield_rails::config::EngineConfig;
use yield_rails::engine::clock::ManualClock;
use yield_rails::engine::{Collaborators, CreatePayment, PaymentEngine};
use yield_rails::ledger::EventStore;
use yield_rails::model::{LedgerEvent, PaymentState};

// ── Harness ──────────────────────────────────────────────────────────

pub struct Harness {
    pub engine: PaymentEngine,
    pub store: EventStore,
    pub clock: Arc<ManualClock>,
    pub tbill: Arc<MockStrategy>,
    pub source: Arc<MockChainClient>,
    pub destination: Arc<MockChainClient>,
    pub attestation: Arc<MockAttestationClient>,
}

pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_767_225_600, 0).unwrap()
}

/// Engine config with millisecond-scale backoffs and short bridge deadlines
/// so failure paths resolve within test time.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_retries: 0,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_pct: 0,
        chain_timeout_secs: 2,
        bridge_burn_timeout_secs: 2,
        bridge_attestation_timeout_secs: 2,
        bridge_mint_timeout_secs: 2,
        attestation_poll_interval_ms: 10,
        ..EngineConfig::default()
    }
}

pub async fn harness() -> Harness {
    build(fast_config(), MockAttestationClient::ready_after(2), Arc::new(AllowAll)).await
}

pub async fn harness_with_config(config: EngineConfig) -> Harness {
    build(config, MockAttestationClient::ready_after(2), Arc::new(AllowAll)).await
}

pub async fn harness_with_attestation(attestation: MockAttestationClient) -> Harness {
    build(fast_config(), attestation, Arc::new(AllowAll)).await
}

pub async fn build(
    config: EngineConfig,
    attestation: MockAttestationClient,
    compliance: Arc<dyn ComplianceChecker>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let tbill = Arc::new(MockStrategy::new("tbill", 400));
    let source = Arc::new(MockChainClient::new("base"));
    let destination = Arc::new(MockChainClient::new("xrpl"));
    let attestation = Arc::new(attestation);

    let store = EventStore::open_in_memory().expect("in-memory store");
    let engine = PaymentEngine::new(
        config,
        store.clone(),
        Collaborators {
            chains: vec![
                source.clone() as Arc<dyn ChainClient>,
                destination.clone() as Arc<dyn ChainClient>,
            ],
            attestation: attestation.clone(),
            adapters: vec![tbill.clone()],
            compliance,
            clock: clock.clone(),
        },
    )
    .await
    .expect("engine construction");

    Harness { engine, store, clock, tbill, source, destination, attestation }
}

// ── Command builders ─────────────────────────────────────────────────

/// 1 USDC, same-chain, against the tbill strategy.
pub fn same_chain_cmd(token: &str) -> CreatePayment {
    CreatePayment {
        user: "alice".into(),
        merchant: "acme".into(),
        principal: "1".parse().unwrap(),
        currency: "USDC".into(),
        source_chain: "base".into(),
        destination_chain: "base".into(),
        strategy_id: "tbill".into(),
        client_token: token.into(),
    }
}

pub fn cross_chain_cmd(token: &str) -> CreatePayment {
    CreatePayment {
        destination_chain: "xrpl".into(),
        ..same_chain_cmd(token)
    }
}

// ── Assertion helpers ────────────────────────────────────────────────

pub async fn wait_for_state(engine: &PaymentEngine, payment_id: &str, target: PaymentState) {
    for _ in 0..500 {
        let state = engine.get_payment(payment_id).expect("payment exists").payment.state;
        if state == target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let state = engine.get_payment(payment_id).unwrap().payment.state;
    panic!("payment {payment_id} stuck in {state:?}, wanted {target:?}");
}

pub fn event_names(events: &[LedgerEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

/// Assert `expected` appears within `names` in order (other events may
/// interleave).
pub fn assert_subsequence(names: &[&str], expected: &[&str]) {
    let mut position = 0;
    for name in names {
        if position < expected.len() && *name == expected[position] {
            position += 1;
        }
    }
    assert_eq!(
        position,
        expected.len(),
        "expected subsequence {expected:?} in {names:?}"
    );
}
