//! Wall-clock abstraction.
//!
//! Quota windows are aligned to wall-clock minutes, so the limiter and the
//! ledger read time through [`Clock`] instead of calling `Utc::now()` directly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Milliseconds in one quota window.
pub const MINUTE_MS: i64 = 60_000;

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Cloned handles share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a manual clock set to `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Create a manual clock at the given epoch milliseconds.
    pub fn at_millis(millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(millis)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Move the clock forward by `ms` milliseconds.
    pub fn advance_millis(&self, ms: i64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The system clock as a shared handle.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Floor a timestamp to the start of its minute.
pub fn minute_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    let millis = at.timestamp_millis();
    let floored = millis - millis.rem_euclid(MINUTE_MS);
    Utc.timestamp_millis_opt(floored).single().unwrap_or(at)
}

/// Start of the minute following `at`.
pub fn next_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    minute_floor(at) + Duration::milliseconds(MINUTE_MS)
}

/// Milliseconds from `now_millis` to the next minute boundary, in `1..=60000`.
pub fn millis_until_next_minute(now_millis: i64) -> u64 {
    (MINUTE_MS - now_millis.rem_euclid(MINUTE_MS)) as u64
}
