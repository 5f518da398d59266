//! Monotonic time sources
//!
//! All position arithmetic runs on microseconds read from a `Clock`, so
//! the tracker and the software sink can be driven by simulated time.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide origin for `SystemClock` readings
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microsecond time source
pub trait Clock: Send + Sync {
    /// Current time in microseconds
    fn now_us(&self) -> i64;

    /// Current time in milliseconds
    fn now_ms(&self) -> i64 {
        self.now_us() / 1000
    }
}

/// Wall clock backed by `Instant`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Lazy::force(&EPOCH);
        SystemClock
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        EPOCH.elapsed().as_micros() as i64
    }
}

/// Manually advanced clock for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    /// Move time forward by `duration`
    pub fn advance(&self, duration: Duration) {
        self.advance_us(duration.as_micros() as i64);
    }

    pub fn advance_us(&self, micros: i64) {
        self.now_us.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn set_us(&self, micros: i64) {
        self.now_us.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}
