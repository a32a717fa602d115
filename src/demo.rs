use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{TimeZone, Utc};

use crate::adapters::mock::MockStrategy;
use crate::chain::mock::{MockAttestationClient, MockChainClient};
use crate::compliance::AllowAll;
use crate::config::EngineConfig;
use crate::engine::clock::ManualClock;
use crate::engine::{Collaborators, CreatePayment, PaymentEngine};
use crate::ledger::EventStore;
use crate::model::PaymentState;

/// Entry point for the `demo` command: drives a same-chain and a cross-chain
/// payment through their full lifecycle on mock collaborators, with a manual
/// clock standing in for a year of accrual.
pub fn run() -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(run_async())
}

async fn run_async() -> Result<()> {
    let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_767_225_600, 0).unwrap()));
    let tbill = Arc::new(MockStrategy::new("tbill-prime", 400));
    let lending = Arc::new(MockStrategy::new("lending-usdc", 650));
    let base = Arc::new(MockChainClient::new("base"));
    let xrpl = Arc::new(MockChainClient::new("xrpl"));

    let config = EngineConfig {
        attestation_poll_interval_ms: 10,
        chain_timeout_secs: 5,
        bridge_burn_timeout_secs: 5,
        bridge_attestation_timeout_secs: 5,
        bridge_mint_timeout_secs: 5,
        max_retries: 2,
        base_delay_ms: 10,
        max_delay_ms: 50,
        ..EngineConfig::default()
    };

    let engine = PaymentEngine::new(
        config,
        EventStore::open_in_memory()?,
        Collaborators {
            chains: vec![base, xrpl],
            attestation: Arc::new(MockAttestationClient::ready_after(2)),
            adapters: vec![tbill, lending],
            compliance: Arc::new(AllowAll),
            clock: clock.clone(),
        },
    )
    .await?;

    println!("=== yield-rails demo ===\n");

    // ── Same-chain payment: one year at 400 bps ──────────────────────
    println!("── Same-chain payment (1 USDC, tbill-prime @ 400 bps, 1 year) ──");
    let payment_id = engine
        .create_payment(CreatePayment {
            user: "alice".into(),
            merchant: "acme-store".into(),
            principal: "1".parse().map_err(|e| anyhow::anyhow!("{e}"))?,
            currency: "USDC".into(),
            source_chain: "base".into(),
            destination_chain: "base".into(),
            strategy_id: "tbill-prime".into(),
            client_token: "demo-create-1".into(),
        })
        .await?;

    clock.advance_secs(365 * 86_400);
    engine.run_health_pass().await;
    engine.run_snapshot_pass().await;

    let released = engine
        .release_payment(&payment_id, "acme-store", "demo-release-1")
        .await?;
    print_outcome(&engine, &payment_id).await?;
    let distribution = released.payment.distribution.context("missing distribution")?;
    println!(
        "distribution: user {} / merchant {} / protocol {}\n",
        distribution.user_yield, distribution.merchant_yield, distribution.protocol_yield
    );

    // ── Cross-chain payment: base → xrpl ─────────────────────────────
    println!("── Cross-chain payment (250 USDC, base → xrpl, lending-usdc @ 650 bps) ──");
    let bridged_id = engine
        .create_payment(CreatePayment {
            user: "bob".into(),
            merchant: "globex".into(),
            principal: "250".parse().map_err(|e| anyhow::anyhow!("{e}"))?,
            currency: "USDC".into(),
            source_chain: "base".into(),
            destination_chain: "xrpl".into(),
            strategy_id: "lending-usdc".into(),
            client_token: "demo-create-2".into(),
        })
        .await?;

    wait_for_state(&engine, &bridged_id, PaymentState::Active).await?;
    clock.advance_secs(30 * 86_400);
    engine.run_health_pass().await;
    engine.run_snapshot_pass().await;
    engine.release_payment(&bridged_id, "globex", "demo-release-2").await?;
    print_outcome(&engine, &bridged_id).await?;

    Ok(())
}

async fn wait_for_state(
    engine: &PaymentEngine,
    payment_id: &str,
    target: PaymentState,
) -> Result<()> {
    for _ in 0..250 {
        let view = engine.get_payment(payment_id).map_err(|e| anyhow::anyhow!("{e}"))?;
        if view.payment.state == target {
            return Ok(());
        }
        if view.payment.state.is_terminal() {
            bail!("payment {payment_id} terminated in {:?}", view.payment.state);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("payment {payment_id} never reached {target:?}")
}

async fn print_outcome(engine: &PaymentEngine, payment_id: &str) -> Result<()> {
    let view = engine.get_payment(payment_id).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!(
        "payment {payment_id}: state {:?}, accrued {}",
        view.payment.state, view.payment.accrued_yield
    );
    for event in engine.events(payment_id).await.map_err(|e| anyhow::anyhow!("{e}"))? {
        println!("  {:>3}  {}", event.seq, event.kind.name());
    }
    Ok(())
}
