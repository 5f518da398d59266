//! Integration test utilities for sinkclock
//!
//! This module provides common utilities for integration testing including:
//! - A session fixture driven by simulated time
//! - PCM generation helpers
//! - Position trace checks

use sinkclock::audio::{
    AudioSinkSession, ChannelMask, ManualClock, SessionOptions, SinkProbe, VirtualSinkFactory,
};
use std::sync::Arc;
use std::time::Duration;

/// Sample rate used by the fixtures
pub const SAMPLE_RATE: u32 = 48_000;

/// Bytes per 16-bit stereo frame
pub const FRAME_SIZE: usize = 4;

/// How long tests wait for background work
pub const WAIT: Duration = Duration::from_secs(5);

/// Test fixture: a session over a virtual sink on a manual clock
pub struct TestFixture {
    pub clock: Arc<ManualClock>,
    pub factory: Arc<VirtualSinkFactory>,
    pub probe: Arc<SinkProbe>,
    pub session: Arc<AudioSinkSession>,
}

impl TestFixture {
    /// Create a fixture with default session options
    pub fn new() -> Self {
        Self::with_options(SessionOptions::default())
    }

    pub fn with_options(options: SessionOptions) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let factory = Arc::new(VirtualSinkFactory::new(clock.clone()));
        let probe = factory.probe();
        let session = Arc::new(AudioSinkSession::with_options(
            factory.clone(),
            clock.clone(),
            options,
        ));

        Self {
            clock,
            factory,
            probe,
            session,
        }
    }

    /// Fixture with a stereo 48kHz session already initialized
    pub fn initialized() -> anyhow::Result<Self> {
        let fixture = Self::new();
        fixture.session.init(SAMPLE_RATE, ChannelMask::STEREO)?;
        Ok(fixture)
    }

    /// Write `frames` of silence presented at `presentation_time_us`
    pub fn write_frames(&self, frames: usize, presentation_time_us: i64) -> anyhow::Result<usize> {
        Ok(self.session.write(&pcm(frames), presentation_time_us)?)
    }

    /// Advance simulated time
    pub fn advance_ms(&self, millis: i64) {
        self.clock.advance_us(millis * 1_000);
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// `frames` of 16-bit stereo silence
pub fn pcm(frames: usize) -> Vec<u8> {
    vec![0u8; frames * FRAME_SIZE]
}

/// Duration of `frames` at the fixture rate
pub fn frames_us(frames: usize) -> i64 {
    frames as i64 * 1_000_000 / SAMPLE_RATE as i64
}

/// Utilities for checking reported positions
pub mod position_trace {
    /// Sequence of positions reported over time
    #[derive(Debug, Default)]
    pub struct PositionTrace {
        positions: Vec<i64>,
    }

    impl PositionTrace {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn record(&mut self, position_us: i64) {
            self.positions.push(position_us);
        }

        pub fn len(&self) -> usize {
            self.positions.len()
        }

        pub fn is_empty(&self) -> bool {
            self.positions.is_empty()
        }

        pub fn last(&self) -> Option<i64> {
            self.positions.last().copied()
        }

        /// Whether no position went backwards
        pub fn is_monotonic(&self) -> bool {
            self.positions.windows(2).all(|w| w[1] >= w[0])
        }

        /// Largest step between consecutive positions
        pub fn max_step_us(&self) -> i64 {
            self.positions
                .windows(2)
                .map(|w| w[1] - w[0])
                .max()
                .unwrap_or(0)
        }
    }
}
