//! Reference clock shared between the audio output and its consumers
//!
//! The audio output is the master: whenever a position is read from the
//! sink it is written here, and whoever needs the presentation time while
//! the sink cannot answer (paused, not started, between sinks) reads the
//! last rendered value instead.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Last rendered presentation time, in microseconds
#[derive(Debug, Default)]
pub struct MasterClock {
    /// Current PTS in microseconds
    current_pts: AtomicI64,

    /// Whether a PTS was ever set
    valid: AtomicBool,
}

impl MasterClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set current PTS
    pub fn set_pts(&self, pts_us: i64) {
        self.current_pts.store(pts_us, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Get current PTS
    pub fn get_pts(&self) -> i64 {
        self.current_pts.load(Ordering::Acquire)
    }

    pub fn is_set(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Forget the current PTS
    pub fn reset(&self) {
        self.valid.store(false, Ordering::Release);
        self.current_pts.store(0, Ordering::Release);
    }
}
