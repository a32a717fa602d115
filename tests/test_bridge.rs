mod engine_common;

use engine_common::*;
use yield_rails::chain::ChainEvent;
use yield_rails::chain::mock::MockAttestationClient;
use yield_rails::error::EngineError;
use yield_rails::model::{Amount, PaymentState};

#[tokio::test]
async fn bridge_happy_path_orders_events_and_settles_on_destination() {
    let h = harness().await;
    let payment_id = h.engine.create_payment(cross_chain_cmd("tok-b1")).await.unwrap();

    wait_for_state(&h.engine, &payment_id, PaymentState::Active).await;
    let view = h.engine.get_payment(&payment_id).unwrap();
    assert!(view.payment.bridge_ref.is_some());
    assert!(view.payment.bridge_quote.is_some());
    assert!(view.payment.bridge_attestation.is_some());
    assert!(view.payment.destination_escrow_ref.is_some());
    assert!(h.attestation.polls() >= 3, "consensus required repeated polling");

    h.clock.advance_secs(30 * 86_400);
    h.engine.run_health_pass().await;
    h.engine.run_snapshot_pass().await;
    let released =
        h.engine.release_payment(&payment_id, "acme", "tok-b1-release").await.unwrap();
    assert_eq!(released.payment.state, PaymentState::Completed);

    // Settlement happens against the destination-side escrow.
    assert_eq!(h.destination.releases().len(), 1);
    assert!(h.source.releases().is_empty());

    let events = h.engine.events(&payment_id).await.unwrap();
    assert_subsequence(&event_names(&events), &[
        "Admitted",
        "EscrowDeposited",
        "BridgeInitiated",
        "BridgeAttested",
        "BridgeDelivered",
        "YieldSnapshot",
        "ReleaseRequested",
        "DistributionComputed",
        "SettlementSubmitted",
        "SettlementConfirmed",
    ]);
    // Strategy re-allocation on the destination chain is in the log too.
    assert_subsequence(&event_names(&events), &["BridgeDelivered", "StrategyAllocated"]);
}

#[tokio::test]
async fn attestation_timeout_refunds_on_the_source_chain() {
    let mut config = fast_config();
    config.bridge_attestation_timeout_secs = 1;
    let h = build(
        config,
        MockAttestationClient::never(),
        std::sync::Arc::new(yield_rails::compliance::AllowAll),
    )
    .await;

    let payment_id = h.engine.create_payment(cross_chain_cmd("tok-b2")).await.unwrap();
    wait_for_state(&h.engine, &payment_id, PaymentState::Refunded).await;

    let view = h.engine.get_payment(&payment_id).unwrap();
    assert!(view.payment.refund_tx.is_some());
    assert_eq!(view.payment.accrued_yield, Amount::ZERO);
    assert_eq!(h.source.refunds().len(), 1);
    assert!(h.destination.refunds().is_empty());

    let names = event_names(&h.engine.events(&payment_id).await.unwrap());
    assert_subsequence(&names, &[
        "Admitted",
        "EscrowDeposited",
        "BridgeInitiated",
        "RefundRequested",
        "RefundConfirmed",
    ]);
    assert!(!names.contains(&"DistributionComputed"), "no split on a refunded payment");
    assert!(!names.contains(&"BridgeAttested"));
}

#[tokio::test]
async fn late_delivery_after_refund_raises_reconciliation() {
    let mut config = fast_config();
    config.bridge_attestation_timeout_secs = 1;
    let h = build(
        config,
        MockAttestationClient::never(),
        std::sync::Arc::new(yield_rails::compliance::AllowAll),
    )
    .await;

    let payment_id = h.engine.create_payment(cross_chain_cmd("tok-b3")).await.unwrap();
    wait_for_state(&h.engine, &payment_id, PaymentState::Refunded).await;

    // The destination confirmation shows up after the refund already landed.
    let err = h
        .engine
        .handle_chain_event(ChainEvent::BridgeDeliveryConfirmed {
            payment_id: payment_id.clone(),
            escrow_ref: "xrpl-esc-late".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DoubleSpendSuspected { .. }));

    let view = h.engine.get_payment(&payment_id).unwrap();
    assert_eq!(view.payment.state, PaymentState::Refunded, "state never moves backward");
    assert!(view.payment.reconciliation_required);
    assert!(event_names(&h.engine.events(&payment_id).await.unwrap()).contains(&"StaleEvent"));
}

#[tokio::test]
async fn duplicate_chain_confirmation_is_recorded_as_stale() {
    let h = harness().await;
    let payment_id = h.engine.create_payment(same_chain_cmd("tok-b4")).await.unwrap();

    let escrow_ref = h.engine.get_payment(&payment_id).unwrap().payment.escrow_ref.unwrap();
    h.engine
        .handle_chain_event(ChainEvent::DepositConfirmed {
            payment_id: payment_id.clone(),
            escrow_ref,
        })
        .await
        .unwrap();

    let view = h.engine.get_payment(&payment_id).unwrap();
    assert_eq!(view.payment.state, PaymentState::Active, "stale events never move state");
    assert!(!view.payment.reconciliation_required);
    assert!(event_names(&h.engine.events(&payment_id).await.unwrap()).contains(&"StaleEvent"));
}
