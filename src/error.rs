use thiserror::Error;

use crate::model::{PaymentId, PaymentState, StrategyId};

/// Typed errors surfaced to command and query callers.
///
/// `Internal` is the catch-all; anything the engine can classify uses a
/// dedicated variant.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("compliance screen denied: {reason}")]
    ComplianceRejected { reason: String },

    #[error("client token already used by a different command")]
    Duplicate { payment_id: PaymentId },

    #[error("command {command} does not apply to payment {payment_id} in state {state:?}")]
    InvalidTransition {
        payment_id: PaymentId,
        state: PaymentState,
        command: &'static str,
    },

    #[error("caller is not the party of record for this operation")]
    Unauthorized,

    #[error("strategy {strategy_id} unavailable (circuit open or retries exhausted)")]
    AdapterUnavailable { strategy_id: StrategyId },

    #[error("bridge step {step} exceeded its deadline for payment {payment_id}")]
    BridgeTimeout { payment_id: PaymentId, step: String },

    #[error("payment {payment_id} requires reconciliation: bridge delivery raced a refund")]
    DoubleSpendSuspected { payment_id: PaymentId },

    #[error("command queue full")]
    Overloaded,

    /// Ledger durability failures are fatal to the in-flight transition; the
    /// recovery path is a restart fold from the log, never a masked write.
    #[error("ledger storage failure: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(format!("payload encoding: {err}"))
    }
}
