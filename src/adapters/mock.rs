use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::model::{Amount, ExternalOpId, PositionRef};

use super::{AdapterError, AdapterHealth, StrategyAdapter, StrategySettlement};

/// In-memory strategy with scriptable APY and failure injection. Used by the
/// demo command and the integration tests.
pub struct MockStrategy {
    id: String,
    apy_bps: AtomicU32,
    healthy: AtomicBool,
    /// Next N calls fail with a transient error.
    fail_remaining: AtomicU32,
    permanent_failure: RwLock<Option<String>>,
    /// Idempotency: one position per operation id.
    positions: DashMap<ExternalOpId, PositionRef>,
    position_counter: AtomicU64,
    allocate_calls: AtomicU32,
    withdraw_calls: AtomicU32,
    apy_calls: AtomicU32,
    health_calls: AtomicU32,
}

impl MockStrategy {
    pub fn new(id: &str, apy_bps: u32) -> Self {
        MockStrategy {
            id: id.to_string(),
            apy_bps: AtomicU32::new(apy_bps),
            healthy: AtomicBool::new(true),
            fail_remaining: AtomicU32::new(0),
            permanent_failure: RwLock::new(None),
            positions: DashMap::new(),
            position_counter: AtomicU64::new(0),
            allocate_calls: AtomicU32::new(0),
            withdraw_calls: AtomicU32::new(0),
            apy_calls: AtomicU32::new(0),
            health_calls: AtomicU32::new(0),
        }
    }

    pub fn set_apy(&self, apy_bps: u32) {
        self.apy_bps.store(apy_bps, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Fail the next `n` calls (any method) with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_permanent_failure(&self, reason: Option<String>) {
        *self.permanent_failure.write() = reason;
    }

    pub fn allocate_calls(&self) -> u32 {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    pub fn withdraw_calls(&self) -> u32 {
        self.withdraw_calls.load(Ordering::SeqCst)
    }

    pub fn apy_calls(&self) -> u32 {
        self.apy_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> u32 {
        self.health_calls.load(Ordering::SeqCst)
    }

    /// Distinct positions created, regardless of call count.
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    fn check_failures(&self) -> Result<(), AdapterError> {
        if let Some(reason) = self.permanent_failure.read().clone() {
            return Err(AdapterError::Permanent(reason));
        }
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(AdapterError::Transient("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StrategyAdapter for MockStrategy {
    fn strategy_id(&self) -> &str {
        &self.id
    }

    async fn allocate(
        &self,
        op_id: &str,
        _payment_id: &str,
        _amount: Amount,
        _deadline: Instant,
    ) -> Result<PositionRef, AdapterError> {
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failures()?;
        let position = self
            .positions
            .entry(op_id.to_string())
            .or_insert_with(|| {
                let n = self.position_counter.fetch_add(1, Ordering::SeqCst);
                format!("{}-pos-{n}", self.id)
            })
            .clone();
        Ok(position)
    }

    async fn withdraw(
        &self,
        _op_id: &str,
        position_ref: &str,
        amount: Amount,
        _deadline: Instant,
    ) -> Result<StrategySettlement, AdapterError> {
        self.withdraw_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failures()?;
        Ok(StrategySettlement {
            reference: format!("{position_ref}-settlement"),
            principal: amount,
            yield_paid: Amount::ZERO,
        })
    }

    async fn current_apy(&self, _deadline: Instant) -> Result<u32, AdapterError> {
        self.apy_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failures()?;
        Ok(self.apy_bps.load(Ordering::SeqCst))
    }

    async fn health(&self, _deadline: Instant) -> Result<AdapterHealth, AdapterError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failures()?;
        Ok(AdapterHealth { healthy: self.healthy.load(Ordering::SeqCst), latency_ms: 5 })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn allocate_is_idempotent_per_op_id() {
        let mock = MockStrategy::new("tbill", 400);
        let deadline = Instant::now() + Duration::from_secs(1);
        let amount = Amount::from_micros(1_000_000);

        let first = mock.allocate("op-1", "pay-1", amount, deadline).await.unwrap();
        let retried = mock.allocate("op-1", "pay-1", amount, deadline).await.unwrap();
        assert_eq!(first, retried);
        assert_eq!(mock.position_count(), 1);

        let second = mock.allocate("op-2", "pay-1", amount, deadline).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(mock.position_count(), 2);
    }

    #[tokio::test]
    async fn failure_injection_is_consumed() {
        let mock = MockStrategy::new("tbill", 400);
        let deadline = Instant::now() + Duration::from_secs(1);
        mock.fail_next(2);
        assert!(mock.current_apy(deadline).await.is_err());
        assert!(mock.current_apy(deadline).await.is_err());
        assert_eq!(mock.current_apy(deadline).await.unwrap(), 400);
    }
}
