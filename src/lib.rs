//! sinkclock - streaming PCM output with a drift-corrected playback clock
//!
//! The crate streams PCM into a playback sink and reports which
//! presentation time is being heard right now, correcting for device
//! latency, jittery frame counters and discontinuities in the written
//! stream.
//!
//! - [`audio`]: sinks, the position tracker and the sink session
//! - [`player`]: a pull-driven feeder thread on top of a session
//! - [`utils`]: errors, configuration and time conversions

pub mod audio;
pub mod player;
pub mod utils;

pub use audio::{
    AudioSessionConfig, AudioSinkSession, ChannelMask, Clock, MasterClock, PcmEncoding,
    PlaybackSink, SessionOptions, SessionStats, SessionStatus, SinkFactory, SystemClock,
};
pub use player::{AudioPlayer, PcmChunk, PcmSource};
pub use utils::{Config, Result, SinkClockError};
