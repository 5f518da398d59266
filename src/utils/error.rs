//! Error types for sinkclock
//!
//! This module defines the error type shared by the sink session, the
//! position tracker and the sink implementations. We use thiserror for
//! the library error type and keep anyhow at the binary edge.

use crate::audio::{ChannelMask, SinkState};
use std::fmt;
use thiserror::Error;

/// Configuration that was requested when a sink could not be created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Output channel mask
    pub channel_mask: ChannelMask,

    /// Buffer size in bytes (0 when sizing itself failed)
    pub buffer_size: usize,
}

impl fmt::Display for RequestedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Config({}, {:#x}, {})",
            self.sample_rate,
            self.channel_mask.bits(),
            self.buffer_size
        )
    }
}

/// Main error type for sinkclock
#[derive(Error, Debug)]
pub enum SinkClockError {
    /// The sink rejected the configuration or never reached the initialized state
    #[error("Sink init failed: {device_state:?}, {requested}")]
    InitializationFailed {
        requested: RequestedConfig,
        device_state: Option<SinkState>,
    },

    /// The sink reported a negative byte count for a write
    #[error("Sink write failed: code {code}, requested {requested} bytes")]
    WriteFailed { code: isize, requested: usize },

    /// The sink claims to be playing but its position counter is frozen
    #[error("Sink stalled for {stalled_for_ms}ms")]
    Stalled { stalled_for_ms: i64 },

    /// Optional sink capability that is not available
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Device-level errors (play/pause/flush/release, stream creation)
    #[error("Device error: {0}")]
    Device(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SinkClockError {
    /// Create a device error from string
    pub fn device<S: Into<String>>(msg: S) -> Self {
        SinkClockError::Device(msg.into())
    }

    /// Whether the error came out of `init()` / lazy re-initialization
    pub fn is_initialization_failure(&self) -> bool {
        matches!(self, SinkClockError::InitializationFailed { .. })
    }
}

/// Convenience type alias for Results in sinkclock
pub type Result<T> = std::result::Result<T, SinkClockError>;

/// Extension trait for converting other errors to SinkClockError
pub trait IntoSinkError<T> {
    /// Convert this error into a SinkClockError with the given context
    fn device_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
    fn internal_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoSinkError<T> for std::result::Result<T, E> {
    fn device_err(self, context: &str) -> Result<T> {
        self.map_err(|e| SinkClockError::Device(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| SinkClockError::Config(format!("{}: {}", context, e)))
    }

    fn internal_err(self, context: &str) -> Result<T> {
        self.map_err(|e| SinkClockError::Internal(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SinkClockError::InitializationFailed {
            requested: RequestedConfig {
                sample_rate: 44100,
                channel_mask: ChannelMask::STEREO,
                buffer_size: 17640,
            },
            device_state: Some(SinkState::Uninitialized),
        };
        assert_eq!(
            err.to_string(),
            "Sink init failed: Some(Uninitialized), Config(44100, 0xc, 17640)"
        );
        assert!(err.is_initialization_failure());

        let err = SinkClockError::WriteFailed { code: -3, requested: 4096 };
        assert_eq!(err.to_string(), "Sink write failed: code -3, requested 4096 bytes");
        assert!(!err.is_initialization_failure());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: SinkClockError = io_err.into();
        assert!(matches!(err, SinkClockError::FileIO(_)));
    }

    #[test]
    fn test_into_sink_error_trait() {
        let result: std::result::Result<(), &str> = Err("stream closed");

        match result.device_err("Pausing output") {
            Err(SinkClockError::Device(msg)) => {
                assert_eq!(msg, "Pausing output: stream closed");
            }
            _ => panic!("Expected Device error"),
        }
    }
}
