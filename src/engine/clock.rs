use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Time source for accrual and deadlines, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and the demo to walk
/// a payment through days of accrual in microseconds of wall time.
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock { now: RwLock::new(start) }
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.write();
        *now += Duration::seconds(secs);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
