use crate::engine::lifecycle;
use crate::error::EngineError;
use crate::model::{EventKind, LedgerEvent, Payment, PaymentState};

/// Apply one ledger event to the current projection.
///
/// The fold is deterministic and replay-tolerant: an event at or below the
/// projection's `last_seq` is skipped, a gap is a storage-level corruption.
pub fn apply(current: Option<Payment>, event: &LedgerEvent) -> Result<Payment, EngineError> {
    let mut payment = match (current, &event.kind) {
        (None, EventKind::Admitted {
            user,
            merchant,
            principal,
            currency,
            source_chain,
            destination_chain,
            strategy_id,
        }) => {
            if event.seq != 0 {
                return Err(EngineError::Storage(format!(
                    "admission for {} at seq {}, expected 0",
                    event.payment_id, event.seq
                )));
            }
            return Ok(Payment {
                id: event.payment_id.clone(),
                user: user.clone(),
                merchant: merchant.clone(),
                principal: *principal,
                currency: currency.clone(),
                source_chain: source_chain.clone(),
                destination_chain: destination_chain.clone(),
                strategy_id: strategy_id.clone(),
                state: PaymentState::Pending,
                created_at: event.at,
                activated_at: None,
                released_at: None,
                terminated_at: None,
                accrued_yield: crate::model::Amount::ZERO,
                distribution: None,
                escrow_ref: None,
                destination_escrow_ref: None,
                position_ref: None,
                bridge_ref: None,
                bridge_quote: None,
                bridge_attestation: None,
                settlement_tx: None,
                refund_tx: None,
                failure_reason: None,
                reconciliation_required: false,
                last_seq: 0,
                last_apy_bps: None,
                last_snapshot_at: None,
            });
        }
        (None, other) => {
            return Err(EngineError::Storage(format!(
                "event {} for unknown payment {}",
                other.name(),
                event.payment_id
            )));
        }
        (Some(payment), EventKind::Admitted { .. }) => {
            if event.seq <= payment.last_seq {
                return Ok(payment);
            }
            return Err(EngineError::Storage(format!(
                "duplicate admission for {}",
                event.payment_id
            )));
        }
        (Some(payment), _) => payment,
    };

    // Replay: already folded.
    if event.seq <= payment.last_seq {
        return Ok(payment);
    }
    if event.seq != payment.last_seq + 1 {
        return Err(EngineError::Storage(format!(
            "event gap for {}: have seq {}, got {}",
            event.payment_id, payment.last_seq, event.seq
        )));
    }

    let next_state = lifecycle::state_after(payment.state, &event.kind, payment.is_cross_chain())
        .ok_or_else(|| EngineError::InvalidTransition {
            payment_id: payment.id.clone(),
            state: payment.state,
            command: event.kind.name(),
        })?;

    match &event.kind {
        EventKind::Admitted { .. } => unreachable!("handled above"),
        EventKind::EscrowDeposited { escrow_ref } => {
            payment.escrow_ref = Some(escrow_ref.clone());
            if next_state == PaymentState::Active {
                payment.activated_at = Some(event.at);
            }
        }
        EventKind::StrategyAllocated { strategy_id, position_ref } => {
            payment.strategy_id = strategy_id.clone();
            payment.position_ref = Some(position_ref.clone());
        }
        EventKind::YieldSnapshot { apy_bps, accrued, stale: _ } => {
            payment.accrued_yield = *accrued;
            payment.last_apy_bps = Some(*apy_bps);
            payment.last_snapshot_at = Some(event.at);
        }
        EventKind::ReleaseRequested { .. } => {}
        EventKind::DistributionComputed { distribution } => {
            payment.distribution = Some(*distribution);
        }
        EventKind::SettlementSubmitted { tx_ref } => {
            payment.settlement_tx = Some(tx_ref.clone());
            payment.released_at = Some(event.at);
        }
        EventKind::SettlementConfirmed { tx_ref } => {
            payment.settlement_tx = Some(tx_ref.clone());
            payment.terminated_at = Some(event.at);
        }
        EventKind::BridgeInitiated { burn_tx, quote } => {
            payment.bridge_ref = Some(burn_tx.clone());
            payment.bridge_quote = Some(*quote);
        }
        EventKind::BridgeAttested { signature } => {
            payment.bridge_attestation = Some(signature.clone());
        }
        EventKind::BridgeDelivered { mint_escrow_ref, .. } => {
            payment.destination_escrow_ref = Some(mint_escrow_ref.clone());
            payment.activated_at = Some(event.at);
        }
        EventKind::RefundRequested { reason } => {
            payment.failure_reason = Some(reason.clone());
        }
        EventKind::RefundConfirmed { tx_ref } => {
            payment.refund_tx = Some(tx_ref.clone());
            payment.terminated_at = Some(event.at);
        }
        EventKind::Failed { reason } => {
            payment.failure_reason = Some(reason.clone());
            payment.terminated_at = Some(event.at);
        }
        EventKind::StaleEvent { reconciliation, .. } => {
            if *reconciliation {
                payment.reconciliation_required = true;
            }
        }
    }

    payment.state = next_state;
    payment.last_seq = event.seq;
    Ok(payment)
}

/// Fold a payment's full event stream, in order.
pub fn fold(events: &[LedgerEvent]) -> Result<Payment, EngineError> {
    let mut current: Option<Payment> = None;
    for event in events {
        current = Some(apply(current, event)?);
    }
    current.ok_or_else(|| EngineError::Storage("empty event stream".into()))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::{Amount, Distribution};

    fn event(seq: u64, kind: EventKind) -> LedgerEvent {
        LedgerEvent {
            seq,
            payment_id: "pay-1".into(),
            at: Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
            kind,
        }
    }

    fn happy_path_events() -> Vec<LedgerEvent> {
        vec![
            event(0, EventKind::Admitted {
                user: "alice".into(),
                merchant: "acme".into(),
                principal: Amount::from_micros(1_000_000),
                currency: "USDC".into(),
                source_chain: "base".into(),
                destination_chain: "base".into(),
                strategy_id: "tbill".into(),
            }),
            event(1, EventKind::EscrowDeposited { escrow_ref: "esc-1".into() }),
            event(2, EventKind::StrategyAllocated {
                strategy_id: "tbill".into(),
                position_ref: "pos-1".into(),
            }),
            event(3, EventKind::YieldSnapshot {
                apy_bps: 400,
                accrued: Amount::from_micros(40_000),
                stale: false,
            }),
            event(4, EventKind::ReleaseRequested { caller: "acme".into() }),
            event(5, EventKind::DistributionComputed {
                distribution: Distribution {
                    user_yield: Amount::from_micros(28_000),
                    merchant_yield: Amount::from_micros(8_000),
                    protocol_yield: Amount::from_micros(4_000),
                },
            }),
            event(6, EventKind::SettlementSubmitted { tx_ref: "tx-9".into() }),
            event(7, EventKind::SettlementConfirmed { tx_ref: "tx-9".into() }),
        ]
    }

    #[test]
    fn fold_reaches_completed_with_distribution() {
        let payment = fold(&happy_path_events()).unwrap();
        assert_eq!(payment.state, PaymentState::Completed);
        assert_eq!(payment.accrued_yield, Amount::from_micros(40_000));
        let dist = payment.distribution.unwrap();
        assert_eq!(dist.total(), payment.accrued_yield);
        assert_eq!(payment.escrow_ref.as_deref(), Some("esc-1"));
        assert_eq!(payment.settlement_tx.as_deref(), Some("tx-9"));
        assert!(payment.terminated_at.is_some());
    }

    #[test]
    fn fold_is_deterministic() {
        let a = fold(&happy_path_events()).unwrap();
        let b = fold(&happy_path_events()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn replayed_events_are_skipped() {
        let events = happy_path_events();
        let mut current: Option<Payment> = None;
        for event in &events {
            current = Some(apply(current, event).unwrap());
            // Replaying the same event must not change the projection.
            let replayed = apply(current.clone(), event).unwrap();
            assert_eq!(Some(&replayed), current.as_ref());
        }
    }

    #[test]
    fn gap_in_sequence_is_storage_corruption() {
        let events = happy_path_events();
        let payment = apply(None, &events[0]).unwrap();
        let err = apply(Some(payment), &events[2]).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let mut payment = apply(None, &happy_path_events()[0]).unwrap();
        // Settlement before the escrow deposit is not a legal fold.
        let bad = event(1, EventKind::SettlementSubmitted { tx_ref: "tx".into() });
        let err = apply(Some(payment.clone()), &bad).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        // Cross-chain admission routes the deposit to Bridging.
        payment.destination_chain = "arbitrum".into();
        let deposited =
            apply(Some(payment), &event(1, EventKind::EscrowDeposited { escrow_ref: "e".into() }))
                .unwrap();
        assert_eq!(deposited.state, PaymentState::Bridging);
    }

    #[test]
    fn reconciliation_stale_event_flags_payment() {
        let mut events = happy_path_events();
        events.push(event(8, EventKind::StaleEvent {
            description: "bridge delivery after refund".into(),
            reconciliation: true,
        }));
        let payment = fold(&events).unwrap();
        assert_eq!(payment.state, PaymentState::Completed);
        assert!(payment.reconciliation_required);
    }
}
