//! Binary "release complete" gate
//!
//! Closed while a sink is being torn down in the background, open
//! otherwise. Creating a new sink blocks on the gate so that at most one
//! device instance exists per session.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ReleaseGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl ReleaseGate {
    /// Create a gate in the given state
    pub fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            cond: Condvar::new(),
        }
    }

    /// Open the gate and wake every waiter
    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cond.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until the gate is open
    pub fn block(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    /// Block until the gate is open or `timeout` elapses; returns whether it opened
    pub fn block_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.cond.wait_until(&mut open, deadline).timed_out() {
                return *open;
            }
        }
        true
    }
}

impl Default for ReleaseGate {
    fn default() -> Self {
        Self::new(true)
    }
}
