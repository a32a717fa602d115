use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Per-adapter failure isolation. Shared across all payments; updates are
/// atomic, reads are lock-free.
///
/// `failure_threshold` consecutive failures open the breaker. While open,
/// `try_acquire` denies every call until `open_duration` elapses, after which
/// exactly one probe is admitted (half-open). A successful probe closes the
/// breaker, a failed one reopens it.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration_ms: i64,
    failures: AtomicU32,
    state: AtomicU8,
    opened_at_ms: AtomicI64,
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        CircuitBreaker {
            failure_threshold: failure_threshold.max(1),
            open_duration_ms: open_duration.as_millis() as i64,
            failures: AtomicU32::new(0),
            state: AtomicU8::new(CLOSED),
            opened_at_ms: AtomicI64::new(0),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a call may proceed at `now`. Denials are the fail-fast path.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            OPEN => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if now.timestamp_millis() - opened < self.open_duration_ms {
                    return false;
                }
                // Window elapsed: move to half-open and admit a single probe.
                let _ = self.state.compare_exchange(
                    OPEN,
                    HALF_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.acquire_probe()
            }
            _ => self.acquire_probe(),
        }
    }

    fn acquire_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => self.reopen(now),
            _ => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    self.reopen(now);
                }
            }
        }
    }

    fn reopen(&self, now: DateTime<Utc>) {
        self.opened_at_ms.store(now.timestamp_millis(), Ordering::Release);
        self.state.store(OPEN, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Observed state at `now`. An open breaker past its window reads as
    /// `HalfOpen` even before the next probe arrives.
    pub fn state(&self, now: DateTime<Utc>) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            CLOSED => BreakerState::Closed,
            OPEN => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if now.timestamp_millis() - opened >= self.open_duration_ms {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
            _ => BreakerState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for i in 0..4 {
            assert!(breaker.try_acquire(at(i)));
            breaker.record_failure(at(i));
            assert_eq!(breaker.state(at(i)), BreakerState::Closed);
        }
        assert!(breaker.try_acquire(at(4)));
        breaker.record_failure(at(4));
        assert_eq!(breaker.state(at(4)), BreakerState::Open);
        assert!(!breaker.try_acquire(at(5)));
        assert!(!breaker.try_acquire(at(34)));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure(at(0));
        breaker.record_failure(at(1));
        breaker.record_success();
        breaker.record_failure(at(2));
        breaker.record_failure(at(3));
        assert_eq!(breaker.state(at(3)), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure(at(0));
        assert_eq!(breaker.state(at(0)), BreakerState::Open);

        // Window elapsed: exactly one probe allowed.
        assert_eq!(breaker.state(at(31)), BreakerState::HalfOpen);
        assert!(breaker.try_acquire(at(31)));
        assert!(!breaker.try_acquire(at(31)));

        breaker.record_success();
        assert_eq!(breaker.state(at(32)), BreakerState::Closed);
        assert!(breaker.try_acquire(at(32)));
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure(at(0));
        assert!(breaker.try_acquire(at(31)));
        breaker.record_failure(at(31));
        assert_eq!(breaker.state(at(32)), BreakerState::Open);
        assert!(!breaker.try_acquire(at(40)));
        // A fresh window admits the next probe.
        assert!(breaker.try_acquire(at(62)));
    }

    #[test]
    fn at_most_threshold_calls_attempted_per_window() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        let mut attempted = 0;
        for i in 0..100 {
            if breaker.try_acquire(at(i / 10)) {
                attempted += 1;
                breaker.record_failure(at(i / 10));
            }
        }
        assert_eq!(attempted, 5);
    }
}
