use std::time::Duration;

use tokio::time::Instant;

use crate::adapters::retry::retry_transient;
use crate::error::EngineError;
use crate::model::{EventKind, PaymentState, TxRef};

use super::PaymentEngine;

/// Cross-chain coordinator for one payment. Spawned after the source-chain
/// escrow confirms; walks burn → attestation → mint, each under its own
/// deadline, and falls back to the refund path on any miss.
///
/// Resume-safe: every step first checks the projection, so a restart skips
/// work that is already in the ledger.
pub(crate) async fn run(engine: PaymentEngine, payment_id: String) {
    if let Err(err) = drive(&engine, &payment_id).await {
        tracing::warn!(payment = %payment_id, error = %err, "bridge failed, entering refund path");
        let reason = err.to_string();
        if let Err(refund_err) = engine.enter_failing_and_refund(&payment_id, &reason).await {
            tracing::error!(payment = %payment_id, error = %refund_err, "bridge refund path failed");
        }
    }
}

async fn drive(engine: &PaymentEngine, payment_id: &str) -> Result<(), EngineError> {
    let config = &engine.inner.config;
    let payment = engine.payment(payment_id)?;
    if payment.state != PaymentState::Bridging {
        return Ok(());
    }
    let source = engine.chain(&payment.source_chain)?;
    let destination = engine.chain(&payment.destination_chain)?;

    // Burn on the source chain, unless a previous run already recorded it.
    let burn_tx: TxRef = match payment.bridge_ref.clone() {
        Some(burn_tx) => burn_tx,
        None => {
            let escrow_ref = payment
                .escrow_ref
                .clone()
                .ok_or_else(|| EngineError::Internal("bridging without an escrow".into()))?;

            let deadline = engine.deadline(config.bridge_burn_timeout_secs);
            let quote = retry_transient(&engine.inner.retry, deadline, || {
                let source = source.clone();
                let destination_chain = payment.destination_chain.clone();
                async move { source.quote_bridge(&destination_chain, payment.principal).await }
            })
            .await
            .map_err(|e| step_timeout(payment_id, "quote", e))?;

            let op_id = crate::model::external_op_id(payment_id, payment.last_seq + 1);
            let burn_tx = retry_transient(&engine.inner.retry, deadline, || {
                let source = source.clone();
                let op_id = op_id.clone();
                let escrow_ref = escrow_ref.clone();
                let destination_chain = payment.destination_chain.clone();
                async move {
                    source
                        .burn_for_bridge(&op_id, &escrow_ref, &destination_chain, deadline)
                        .await
                }
            })
            .await
            .map_err(|e| step_timeout(payment_id, "burn", e))?;

            let _guard = engine.lock(payment_id).await;
            if engine.payment(payment_id)?.state != PaymentState::Bridging {
                return Ok(());
            }
            engine
                .commit(payment_id, EventKind::BridgeInitiated { burn_tx: burn_tx.clone(), quote })
                .await?;
            burn_tx
        }
    };

    // Poll the attestation service until validator consensus or deadline.
    let signature = match engine.payment(payment_id)?.bridge_attestation.clone() {
        Some(signature) => signature,
        None => {
            let deadline = engine.deadline(config.bridge_attestation_timeout_secs);
            let poll_interval = Duration::from_millis(config.attestation_poll_interval_ms.max(1));
            let signature = loop {
                if Instant::now() >= deadline {
                    return Err(EngineError::BridgeTimeout {
                        payment_id: payment_id.to_string(),
                        step: "attestation".into(),
                    });
                }
                match engine.inner.attestation.get_attestation(&burn_tx, deadline).await {
                    Ok(status) if status.ready => {
                        if let Some(signature) = status.signature {
                            break signature;
                        }
                        tracing::warn!(payment = %payment_id, "attestation ready without signature");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(payment = %payment_id, error = %err, "attestation poll failed");
                    }
                }
                tokio::time::sleep(poll_interval).await;
            };

            let _guard = engine.lock(payment_id).await;
            if engine.payment(payment_id)?.state != PaymentState::Bridging {
                return Ok(());
            }
            engine
                .commit(payment_id, EventKind::BridgeAttested { signature: signature.clone() })
                .await?;
            signature
        }
    };

    // Mint on the destination chain and hand accrual over to it.
    {
        let current = engine.payment(payment_id)?;
        if current.state != PaymentState::Bridging {
            return Ok(());
        }
        let deadline = engine.deadline(config.bridge_mint_timeout_secs);
        let op_id = crate::model::external_op_id(payment_id, current.last_seq + 1);
        let mint_escrow_ref = retry_transient(&engine.inner.retry, deadline, || {
            let destination = destination.clone();
            let op_id = op_id.clone();
            let burn_tx = burn_tx.clone();
            let signature = signature.clone();
            let user = current.user.clone();
            let merchant = current.merchant.clone();
            async move {
                destination
                    .mint_from_bridge(
                        &op_id,
                        &burn_tx,
                        &signature,
                        &user,
                        &merchant,
                        current.principal,
                        deadline,
                    )
                    .await
            }
        })
        .await
        .map_err(|e| step_timeout(payment_id, "mint", e))?;

        let _guard = engine.lock(payment_id).await;
        if engine.payment(payment_id)?.state != PaymentState::Bridging {
            return Ok(());
        }
        engine
            .commit(
                payment_id,
                EventKind::BridgeDelivered {
                    mint_escrow_ref,
                    destination_chain: current.destination_chain.clone(),
                },
            )
            .await?;
    }
    tracing::info!(payment = %payment_id, "bridge delivered");

    // Re-allocate on the destination side; accrual restarts from delivery.
    engine.allocate_strategy(payment_id).await
}

fn step_timeout(payment_id: &str, step: &str, err: crate::chain::ChainError) -> EngineError {
    match err {
        crate::chain::ChainError::Rejected(msg) => {
            EngineError::Internal(format!("bridge {step} rejected: {msg}"))
        }
        crate::chain::ChainError::Transient(_) => EngineError::BridgeTimeout {
            payment_id: payment_id.to_string(),
            step: step.to_string(),
        },
    }
}
