use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

/// Millisecond wall-clock source.
///
/// Injectable so that quota day-rollover behavior can be driven
/// deterministically in tests instead of waiting for midnight.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at the given epoch milliseconds.
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    /// Moves the clock to an absolute time.
    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// Formats epoch milliseconds as a calendar day, e.g. "2024-06-14".
pub fn day_string(ms: i64) -> String {
    utc(ms).format("%Y-%m-%d").to_string()
}

/// Formats epoch milliseconds as a compact day integer, e.g. 20240614.
pub fn day_compact(ms: i64) -> i64 {
    utc(ms).format("%Y%m%d").to_string().parse().unwrap_or(0)
}

/// Formats epoch milliseconds as a compact timestamp, e.g. "20240614093005".
pub fn timestamp_compact(ms: i64) -> String {
    utc(ms).format("%Y%m%d%H%M%S").to_string()
}

fn utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
