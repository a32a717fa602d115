use chrono::{DateTime, Utc};

use crate::config::DistributionPolicy;
use crate::model::{Amount, Distribution};

/// Accrual year length, seconds.
pub const SECONDS_PER_YEAR: i128 = 365 * 86_400;

/// Denominator of the accrual rate: bps scale times the year length.
const RATE_DENOM: i128 = 10_000 * SECONDS_PER_YEAR;

/// Live accrual state for one payment.
///
/// Accrued yield is kept as an exact integer numerator
/// (`Σ principal · apyBps · dt`); the visible amount is its floor against
/// `RATE_DENOM`. The carry means snapshot cadence never loses micro-units:
/// any partition of an interval folds to the same total.
#[derive(Debug, Clone)]
pub struct AccrualState {
    numerator: i128,
    last_at: DateTime<Utc>,
    apy_bps: u32,
}

impl AccrualState {
    pub fn new(at: DateTime<Utc>, apy_bps: u32) -> Self {
        AccrualState { numerator: 0, last_at: at, apy_bps }
    }

    /// Rebuild from a persisted snapshot after a restart. The sub-micro
    /// remainder of the previous process is not recoverable; accrual resumes
    /// from the last durably recorded value.
    pub fn restore(accrued: Amount, apy_bps: u32, last_at: DateTime<Utc>) -> Self {
        AccrualState { numerator: accrued.micros() * RATE_DENOM, last_at, apy_bps }
    }

    pub fn apy_bps(&self) -> u32 {
        self.apy_bps
    }

    /// Advance to `now` under the APY in effect since the last observation,
    /// then switch to `apy_bps` for the interval ahead. Returns the accrued
    /// total. Calling this at every snapshot and APY change yields the
    /// piecewise-linear accrual curve.
    pub fn observe(&mut self, principal: Amount, now: DateTime<Utc>, apy_bps: u32) -> Amount {
        let dt = (now - self.last_at).num_seconds().max(0) as i128;
        self.numerator += principal.micros() * self.apy_bps as i128 * dt;
        self.last_at = now;
        self.apy_bps = apy_bps;
        self.accrued()
    }

    /// Accrued total if read at `now`, without mutating. Query-path helper.
    pub fn accrued_at(&self, principal: Amount, now: DateTime<Utc>) -> Amount {
        let dt = (now - self.last_at).num_seconds().max(0) as i128;
        let numerator = self.numerator + principal.micros() * self.apy_bps as i128 * dt;
        Amount::from_micros(numerator / RATE_DENOM)
    }

    pub fn accrued(&self) -> Amount {
        Amount::from_micros(self.numerator / RATE_DENOM)
    }
}

/// Split accrued yield per the configured policy. User and merchant shares
/// round down; the residual lands on the protocol, so the three terms always
/// sum exactly to the input.
pub fn split(accrued: Amount, policy: &DistributionPolicy) -> Distribution {
    let user_yield = accrued.mul_bps_floor(policy.user_bps);
    let merchant_yield = accrued.mul_bps_floor(policy.merchant_bps);
    let protocol_yield = Amount::from_micros(
        accrued.micros() - user_yield.micros() - merchant_yield.micros(),
    );
    Distribution { user_yield, merchant_yield, protocol_yield }
}
