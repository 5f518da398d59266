//! Audio output module for sinkclock
//!
//! This module streams PCM to a playback sink and keeps track of which
//! presentation time is being heard. It is layered as:
//! - `timestamp_poller`: pulls hardware timestamps from the sink at a bounded cadence
//! - `position_tracker`: turns the raw frame counter and timestamps into a smoothed position
//! - `session`: owns the sink lifecycle, the write path and the presentation-time anchor

mod clock;
#[cfg(feature = "cpal-output")]
mod cpal_output;
mod gate;
mod position_tracker;
mod session;
mod sink;
mod sync;
mod timestamp_poller;
mod virtual_sink;

pub use clock::{Clock, ManualClock, SystemClock};
#[cfg(feature = "cpal-output")]
pub use cpal_output::{CpalSink, CpalSinkFactory};
pub use gate::ReleaseGate;
pub use position_tracker::PlaybackClockTracker;
pub use session::{
    AudioSinkSession, PlaybackClockState, SessionOptions, SessionStats, SessionStatus, SyncState,
};
pub use sink::{
    HardwareTimestamp, PlayState, PlaybackSink, SinkFactory, SinkParams, SinkState,
    ERROR_DEAD_OBJECT, ERROR_INVALID_OPERATION,
};
pub use sync::MasterClock;
pub use timestamp_poller::{PollerState, TimestampPoller};
pub use virtual_sink::{SinkProbe, VirtualSink, VirtualSinkFactory};

use crate::utils::duration_us_to_frames;
use crate::utils::frames_to_duration_us;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A minimum length for the sink buffer, in microseconds
pub const MIN_BUFFER_DURATION_US: i64 = 50_000;

/// A maximum length for the sink buffer, in microseconds
pub const MAX_BUFFER_DURATION_US: i64 = 750_000;

/// Factor applied to the minimum buffer size reported by the sink
pub const BUFFER_MULTIPLICATION_FACTOR: usize = 2;

/// Presentation-time deviation beyond which the anchor is resynchronized
pub const DISCONTINUITY_THRESHOLD_US: i64 = 100_000;

/// Volume increment applied per write while fading in
pub const DEFAULT_VOLUME_STEP: f32 = 0.25;

/// PCM sample encoding accepted by the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PcmEncoding {
    /// 16-bit signed integer
    #[default]
    Pcm16Bit,

    /// 32-bit floating point
    PcmFloat,
}

impl PcmEncoding {
    /// Bytes used by one sample of one channel
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Pcm16Bit => 2,
            Self::PcmFloat => 4,
        }
    }
}

/// Output channel mask
///
/// Bit positions follow the usual speaker order starting at front-left
/// (`0x4`), so a mask's population count is its channel count.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask(u32);

impl ChannelMask {
    pub const FRONT_LEFT: ChannelMask = ChannelMask(0x4);
    pub const FRONT_RIGHT: ChannelMask = ChannelMask(0x8);
    pub const MONO: ChannelMask = Self::FRONT_LEFT;
    pub const STEREO: ChannelMask = ChannelMask(0x4 | 0x8);

    /// Wrap raw mask bits
    pub const fn from_bits(bits: u32) -> Self {
        ChannelMask(bits)
    }

    /// Mask with the first `channels` speaker positions set
    pub fn from_channel_count(channels: u16) -> Self {
        let channels = u32::from(channels.min(29));
        ChannelMask(((1u32 << channels) - 1) << 2)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Number of channels in the mask
    pub fn channel_count(&self) -> u16 {
        self.0.count_ones() as u16
    }
}

impl fmt::Debug for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelMask({:#x})", self.0)
    }
}

/// Immutable per-(re)initialization configuration of a sink session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSessionConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Output channel mask
    pub channel_mask: ChannelMask,

    /// Sample encoding
    pub encoding: PcmEncoding,

    /// Bytes per interleaved output frame
    pub output_frame_size: usize,

    /// Sink buffer size in bytes
    pub buffer_size: usize,
}

impl AudioSessionConfig {
    /// Derive the session configuration from the sink's minimum buffer size
    pub fn new(
        sample_rate: u32,
        channel_mask: ChannelMask,
        encoding: PcmEncoding,
        minimum_buffer_size: usize,
        options: &session::SessionOptions,
    ) -> Self {
        let output_frame_size = channel_mask.channel_count() as usize * encoding.bytes_per_sample();
        let buffer_size = compute_buffer_size(
            minimum_buffer_size,
            sample_rate,
            output_frame_size,
            options.buffer_multiplication_factor,
            options.min_buffer_duration_us,
            options.max_buffer_duration_us,
        );

        Self {
            sample_rate,
            channel_mask,
            encoding,
            output_frame_size,
            buffer_size,
        }
    }

    /// Convert a frame count to microseconds at the session rate
    pub fn frames_to_duration_us(&self, frames: i64) -> i64 {
        frames_to_duration_us(frames, self.sample_rate)
    }

    /// Number of whole frames in `bytes`
    pub fn bytes_to_frames(&self, bytes: u64) -> i64 {
        if self.output_frame_size == 0 {
            return 0;
        }
        (bytes / self.output_frame_size as u64) as i64
    }

    /// Duration of audio that fills the sink buffer
    pub fn buffer_duration_us(&self) -> i64 {
        self.frames_to_duration_us(self.bytes_to_frames(self.buffer_size as u64))
    }
}

/// Size the sink buffer
///
/// The sink's minimum is multiplied by `factor` and clamped to
/// `[min_duration_us, max(minimum, max_duration_us)]` worth of frames,
/// then rounded up to a whole number of frames.
pub fn compute_buffer_size(
    minimum: usize,
    sample_rate: u32,
    frame_size: usize,
    factor: usize,
    min_duration_us: i64,
    max_duration_us: i64,
) -> usize {
    let frame_size = frame_size.max(1);
    let multiplied = minimum.saturating_mul(factor);
    let min_app_size = duration_us_to_frames(min_duration_us, sample_rate) as usize * frame_size;
    let max_app_size =
        minimum.max(duration_us_to_frames(max_duration_us, sample_rate) as usize * frame_size);

    let size = min_app_size.max(multiplied.min(max_app_size));
    size.div_ceil(frame_size) * frame_size
}
