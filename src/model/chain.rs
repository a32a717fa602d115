use sha2::{Digest, Sha256};

/// Chain identifier as registered in the engine configuration
/// (e.g. "ethereum", "base", "xrpl").
pub type ChainId = String;

/// Transaction reference returned by a chain client.
pub type TxRef = String;

/// On-chain escrow identifier returned by the escrow contract.
pub type EscrowRef = String;

/// External position reference returned by a strategy adapter.
pub type PositionRef = String;

/// Correlation tag for outbound adapter and chain calls.
pub type ExternalOpId = String;

/// Deterministic operation id for an outbound call: `sha256(paymentId ‖ seq)`.
///
/// Adapters and chain clients round-trip this tag, so a retried call after a
/// crash correlates with the original attempt instead of double-executing.
pub fn external_op_id(payment_id: &str, seq: u64) -> ExternalOpId {
    let mut hasher = Sha256::new();
    hasher.update(payment_id.as_bytes());
    hasher.update(seq.to_be_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_ids_are_deterministic_and_distinct() {
        let a = external_op_id("pay-1", 3);
        let b = external_op_id("pay-1", 3);
        let c = external_op_id("pay-1", 4);
        let d = external_op_id("pay-2", 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
    }
}
