//! Utility module for sinkclock
//!
//! This module provides common utilities used throughout the crate:
//! - Error handling with custom error types
//! - Configuration management
//! - Frame/time conversion helpers

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{BufferConfig, Config, GeneralConfig, OutputConfig, SyncConfig};
pub use error::{IntoSinkError, RequestedConfig, Result, SinkClockError};

/// Microseconds per second
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Initialize the configuration
///
/// Loads configuration from:
/// 1. Default values
/// 2. System configuration file
/// 3. User configuration file
/// 4. Environment variables
pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Convert a frame count to a duration in microseconds at `sample_rate`
pub fn frames_to_duration_us(frames: i64, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    (frames * MICROS_PER_SECOND) / sample_rate as i64
}

/// Convert a duration in microseconds to a frame count at `sample_rate`
pub fn duration_us_to_frames(duration_us: i64, sample_rate: u32) -> i64 {
    (duration_us * sample_rate as i64) / MICROS_PER_SECOND
}

/// Format a position in microseconds for display
///
/// Produces "MM:SS.mmm", or "HH:MM:SS.mmm" past the hour. Negative
/// positions are prefixed with a minus sign.
pub fn format_position_us(position_us: i64) -> String {
    let sign = if position_us < 0 { "-" } else { "" };
    let total_ms = position_us.unsigned_abs() / 1000;
    let millis = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, seconds, millis)
    } else {
        format!("{}{:02}:{:02}.{:03}", sign, minutes, seconds, millis)
    }
}
