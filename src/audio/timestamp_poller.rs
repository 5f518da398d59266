//! Hardware timestamp polling
//!
//! Pulls (frame position, system time) samples from the sink. A freshly
//! polled sample stays pending until the caller accepts or rejects it,
//! because only the caller can sanity-check it against the frame counter.
//!
//! The cadence depends on what the sink has shown so far:
//!
//! | state          | poll interval | leaves when                                   |
//! |----------------|---------------|-----------------------------------------------|
//! | `Initializing` | 10 ms         | a sample is accepted, or 500 ms pass without one |
//! | `Timestamp`    | 10 ms         | two accepted samples show the position advancing |
//! | `Advancing`    | 10 s          | the sink stops returning samples                |
//! | `NoTimestamp`  | 10 s          | the sink starts returning samples              |
//! | `Error`        | 500 ms        | a sample is accepted                           |

use crate::audio::sink::{HardwareTimestamp, PlaybackSink};
use log::debug;
use std::sync::Arc;

const FAST_POLL_INTERVAL_US: i64 = 10_000;
const SLOW_POLL_INTERVAL_US: i64 = 10_000_000;
const ERROR_POLL_INTERVAL_US: i64 = 500_000;

/// How long to wait for a first timestamp before assuming the sink has none
const INITIALIZING_DURATION_US: i64 = 500_000;

/// Polling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Initializing,
    Timestamp,
    Advancing,
    NoTimestamp,
    Error,
}

pub struct TimestampPoller {
    sink: Arc<dyn PlaybackSink>,
    state: PollerState,
    sample_interval_us: i64,
    initialize_time_us: Option<i64>,
    last_poll_time_us: Option<i64>,
    pending: Option<HardwareTimestamp>,
    last_accepted: Option<HardwareTimestamp>,
    previous_accepted: Option<HardwareTimestamp>,
}

impl TimestampPoller {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            state: PollerState::Initializing,
            sample_interval_us: FAST_POLL_INTERVAL_US,
            initialize_time_us: None,
            last_poll_time_us: None,
            pending: None,
            last_accepted: None,
            previous_accepted: None,
        }
    }

    /// Poll the sink if the current interval has elapsed
    ///
    /// Returns whether a new raw sample is pending acceptance.
    pub fn maybe_poll(&mut self, now_us: i64) -> bool {
        if let Some(last_poll) = self.last_poll_time_us {
            if now_us - last_poll < self.sample_interval_us {
                return false;
            }
        }
        self.last_poll_time_us = Some(now_us);

        let sample = self.sink.hardware_timestamp();
        match self.state {
            PollerState::Initializing => {
                let started = *self.initialize_time_us.get_or_insert(now_us);
                if sample.is_none() && now_us - started > INITIALIZING_DURATION_US {
                    debug!("No hardware timestamp after {}us, falling back to slow polling", now_us - started);
                    self.update_state(PollerState::NoTimestamp);
                }
            }
            PollerState::NoTimestamp => {
                if sample.is_some() {
                    self.initialize_time_us = Some(now_us);
                    self.update_state(PollerState::Initializing);
                }
            }
            PollerState::Timestamp | PollerState::Advancing => {
                if sample.is_none() {
                    self.reset();
                    self.last_poll_time_us = Some(now_us);
                }
            }
            PollerState::Error => {}
        }

        self.pending = sample;
        sample.is_some()
    }

    /// Trust the pending sample
    pub fn accept(&mut self) {
        let Some(sample) = self.pending.take() else {
            return;
        };

        // Devices refresh their timestamp less often than we poll
        if self.last_accepted != Some(sample) {
            self.previous_accepted = self.last_accepted;
            self.last_accepted = Some(sample);
        }

        if self.is_advancing() {
            self.update_state(PollerState::Advancing);
        } else {
            self.update_state(PollerState::Timestamp);
        }
    }

    /// Drop the pending sample and back off
    pub fn reject(&mut self) {
        self.pending = None;
        self.update_state(PollerState::Error);
    }

    /// Whether any sample has been accepted since the last reset
    pub fn has_timestamp(&self) -> bool {
        self.last_accepted.is_some()
    }

    /// Whether the two latest accepted samples show the position moving forward
    pub fn is_advancing(&self) -> bool {
        match (self.previous_accepted, self.last_accepted) {
            (Some(previous), Some(last)) => {
                last.position_frames > previous.position_frames
                    && last.system_time_us > previous.system_time_us
            }
            _ => false,
        }
    }

    /// Frame position of the last accepted sample
    pub fn position_frames(&self) -> u64 {
        self.last_accepted.map_or(0, |s| s.position_frames)
    }

    /// System time of the last accepted sample
    pub fn system_time_us(&self) -> i64 {
        self.last_accepted.map_or(0, |s| s.system_time_us)
    }

    /// The sample waiting for accept/reject
    pub fn pending(&self) -> Option<HardwareTimestamp> {
        self.pending
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Forget every sample and restart fast polling
    pub fn reset(&mut self) {
        self.pending = None;
        self.last_accepted = None;
        self.previous_accepted = None;
        self.initialize_time_us = None;
        self.last_poll_time_us = None;
        self.update_state(PollerState::Initializing);
    }

    fn update_state(&mut self, state: PollerState) {
        self.state = state;
        self.sample_interval_us = match state {
            PollerState::Initializing | PollerState::Timestamp => FAST_POLL_INTERVAL_US,
            PollerState::Advancing | PollerState::NoTimestamp => SLOW_POLL_INTERVAL_US,
            PollerState::Error => ERROR_POLL_INTERVAL_US,
        };
    }
}
