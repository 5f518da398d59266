//! Playback sink capability contract
//!
//! A sink is one streaming output device instance. Sinks are shared
//! between the control path and the write path, so every method takes
//! `&self` and implementations synchronize internally.

use crate::audio::{ChannelMask, PcmEncoding};
use crate::utils::error::{Result, SinkClockError};
use std::sync::Arc;

/// Write error code: the sink is not usable for writing
pub const ERROR_INVALID_OPERATION: isize = -3;

/// Write error code: the device behind the sink is gone
pub const ERROR_DEAD_OBJECT: isize = -6;

/// Construction state reported by a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// The device rejected the configuration
    Uninitialized,

    /// Ready to accept writes
    Initialized,
}

/// Playback state reported by a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Paused,
    Playing,
}

/// A hardware presentation sample: this frame was presented at this time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareTimestamp {
    /// Frame position at the sample
    pub position_frames: u64,

    /// Time of the sample, on the same clock the session runs on
    pub system_time_us: i64,
}

/// Parameters for creating a streaming sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkParams {
    pub sample_rate: u32,
    pub channel_mask: ChannelMask,
    pub encoding: PcmEncoding,

    /// Buffer size in bytes
    pub buffer_size: usize,

    /// Audio session to join; `None` lets the device allocate one
    pub session_id: Option<i32>,
}

/// A streaming PCM output device
pub trait PlaybackSink: Send + Sync {
    /// Whether construction succeeded
    fn state(&self) -> SinkState;

    fn play_state(&self) -> PlayState;

    /// Audio session the device assigned to this sink
    fn session_id(&self) -> Option<i32> {
        None
    }

    /// Queue PCM bytes
    ///
    /// May block while the device buffer is full and accept fewer bytes
    /// than offered. A negative value is a device error code.
    fn write(&self, pcm: &[u8]) -> isize;

    /// Frames consumed by the device, wrapping at 2^32
    fn raw_frame_position(&self) -> u32;

    fn set_volume(&self, volume: f32) -> Result<()>;

    /// Latest hardware timestamp, when the device exposes one
    fn hardware_timestamp(&self) -> Option<HardwareTimestamp> {
        None
    }

    /// Total output latency in microseconds, including the sink's own buffer
    fn latency_us(&self) -> Result<i64> {
        Err(SinkClockError::Unsupported("latency query".to_string()))
    }

    fn play(&self) -> Result<()>;

    fn pause(&self) -> Result<()>;

    /// Discard queued data
    fn flush(&self) -> Result<()>;

    /// Free the device resource
    fn release(&self) -> Result<()>;
}

/// Creates sinks for a session
pub trait SinkFactory: Send + Sync {
    /// Smallest buffer the device accepts for this format, `None` if unsupported
    fn minimum_buffer_size(
        &self,
        sample_rate: u32,
        channel_mask: ChannelMask,
        encoding: PcmEncoding,
    ) -> Option<usize>;

    /// Construct a streaming sink
    fn create(&self, params: &SinkParams) -> Result<Arc<dyn PlaybackSink>>;
}
