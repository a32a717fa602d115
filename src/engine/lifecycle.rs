use crate::model::{EventKind, PaymentState};

use PaymentState::*;

/// Whitelisted state transitions. Everything else is `InvalidTransition`.
pub fn allowed(from: PaymentState, to: PaymentState) -> bool {
    matches!(
        (from, to),
        (Pending, Active)
            | (Pending, Bridging)
            | (Pending, Failed)
            | (Active, Releasing)
            | (Active, Failing)
            | (Releasing, Released)
            | (Released, Completed)
            | (Bridging, Active)
            | (Bridging, Failing)
            | (Failing, Refunded)
            | (Failing, Failed)
    )
}

/// Resolve the state a payment occupies after `kind`, or `None` when the
/// event does not apply in `state`. Non-transition events return `state`
/// unchanged when applicable.
pub fn state_after(state: PaymentState, kind: &EventKind, cross_chain: bool) -> Option<PaymentState> {
    let next = match kind {
        // Admission is handled before a state exists.
        EventKind::Admitted { .. } => return None,

        EventKind::EscrowDeposited { .. } => match state {
            Pending if cross_chain => Bridging,
            Pending => Active,
            _ => return None,
        },
        EventKind::StrategyAllocated { .. } if state == Active => Active,
        EventKind::YieldSnapshot { .. } if matches!(state, Active | Releasing) => state,
        EventKind::ReleaseRequested { .. } if state == Active => Releasing,
        EventKind::DistributionComputed { .. } if state == Releasing => Releasing,
        EventKind::SettlementSubmitted { .. } if state == Releasing => Released,
        EventKind::SettlementConfirmed { .. } if state == Released => Completed,

        EventKind::BridgeInitiated { .. } if state == Bridging => Bridging,
        EventKind::BridgeAttested { .. } if state == Bridging => Bridging,
        EventKind::BridgeDelivered { .. } if state == Bridging => Active,

        EventKind::RefundRequested { .. } if matches!(state, Active | Bridging) => Failing,
        EventKind::RefundConfirmed { .. } if state == Failing => Refunded,
        EventKind::Failed { .. } if matches!(state, Pending | Failing) => Failed,

        // Stale callbacks are recorded in any state and never move it.
        EventKind::StaleEvent { .. } => state,

        _ => return None,
    };

    if next != state && !allowed(state, next) {
        return None;
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Amount;

    const ALL: [PaymentState; 9] =
        [Pending, Active, Releasing, Released, Bridging, Completed, Failing, Refunded, Failed];

    #[test]
    fn no_backward_or_terminal_exit() {
        for terminal in [Completed, Refunded, Failed] {
            for to in ALL {
                assert!(!allowed(terminal, to), "{terminal:?} -> {to:?} must be rejected");
            }
        }
        assert!(!allowed(Active, Pending));
        assert!(!allowed(Released, Releasing));
        assert!(!allowed(Releasing, Active));
    }

    #[test]
    fn deposit_routes_by_chain_topology() {
        let kind = EventKind::EscrowDeposited { escrow_ref: "esc-1".into() };
        assert_eq!(state_after(Pending, &kind, false), Some(Active));
        assert_eq!(state_after(Pending, &kind, true), Some(Bridging));
        assert_eq!(state_after(Active, &kind, false), None);
        assert_eq!(state_after(Completed, &kind, false), None);
    }

    #[test]
    fn snapshots_only_while_accruing_or_releasing() {
        let kind = EventKind::YieldSnapshot { apy_bps: 400, accrued: Amount::ZERO, stale: false };
        assert_eq!(state_after(Active, &kind, false), Some(Active));
        assert_eq!(state_after(Releasing, &kind, false), Some(Releasing));
        assert_eq!(state_after(Pending, &kind, false), None);
        assert_eq!(state_after(Refunded, &kind, false), None);
    }

    #[test]
    fn release_path_is_ordered() {
        let release = EventKind::ReleaseRequested { caller: "m".into() };
        let submitted = EventKind::SettlementSubmitted { tx_ref: "tx".into() };
        let confirmed = EventKind::SettlementConfirmed { tx_ref: "tx".into() };
        assert_eq!(state_after(Active, &release, false), Some(Releasing));
        assert_eq!(state_after(Releasing, &submitted, false), Some(Released));
        assert_eq!(state_after(Released, &confirmed, false), Some(Completed));
        // Settlement cannot jump ahead of the release request.
        assert_eq!(state_after(Active, &submitted, false), None);
        assert_eq!(state_after(Releasing, &confirmed, false), None);
    }

    #[test]
    fn bridge_path_and_failure_branches() {
        let initiated = EventKind::BridgeInitiated { burn_tx: "b".into(), quote: Amount::ZERO };
        let attested = EventKind::BridgeAttested { signature: "sig".into() };
        let delivered =
            EventKind::BridgeDelivered { mint_escrow_ref: "e".into(), destination_chain: "dst".into() };
        let refund_req = EventKind::RefundRequested { reason: "timeout".into() };
        let refund_ok = EventKind::RefundConfirmed { tx_ref: "tx".into() };

        assert_eq!(state_after(Bridging, &initiated, true), Some(Bridging));
        assert_eq!(state_after(Bridging, &attested, true), Some(Bridging));
        assert_eq!(state_after(Bridging, &delivered, true), Some(Active));
        assert_eq!(state_after(Bridging, &refund_req, true), Some(Failing));
        assert_eq!(state_after(Active, &refund_req, false), Some(Failing));
        assert_eq!(state_after(Failing, &refund_ok, true), Some(Refunded));
        assert_eq!(
            state_after(Failing, &EventKind::Failed { reason: "refund exhausted".into() }, true),
            Some(Failed)
        );
        assert_eq!(state_after(Releasing, &refund_req, false), None);
    }

    #[test]
    fn stale_events_never_move_state() {
        let kind = EventKind::StaleEvent { description: "late deposit".into(), reconciliation: false };
        for state in ALL {
            assert_eq!(state_after(state, &kind, false), Some(state));
        }
    }
}
