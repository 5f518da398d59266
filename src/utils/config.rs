//! Configuration management for sinkclock
//!
//! This module handles loading and managing configuration from config
//! files and environment variables. File sections may be partial: keys
//! that are not present keep the value from the previous layer.

use crate::audio::{
    ChannelMask, SessionOptions, DEFAULT_VOLUME_STEP, DISCONTINUITY_THRESHOLD_US,
    MAX_BUFFER_DURATION_US, MIN_BUFFER_DURATION_US,
};
use crate::utils::error::{IntoSinkError, Result, SinkClockError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Output device configuration
    pub output: OutputConfig,

    /// Buffer sizing
    pub buffer: BufferConfig,

    /// Presentation-time synchronization
    pub sync: SyncConfig,

    /// General settings
    pub general: GeneralConfig,
}

/// Output device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of output channels
    pub channels: u16,

    /// Audio session to attach new sinks to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i32>,

    /// Initialization attempts made by the feeder before giving up
    pub init_retries: u32,
}

/// Buffer sizing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Factor applied to the sink's minimum buffer size
    pub multiplication_factor: u32,

    /// Lower bound of the buffer, in microseconds of audio
    pub min_buffer_duration_us: i64,

    /// Upper bound of the buffer, in microseconds of audio
    pub max_buffer_duration_us: i64,
}

/// Presentation-time synchronization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Deviation from the expected presentation time that triggers a resync
    pub discontinuity_threshold_us: i64,

    /// Volume increment applied per write while fading in
    pub volume_step: f32,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            session_id: None,
            init_retries: 3,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            multiplication_factor: 2,
            min_buffer_duration_us: MIN_BUFFER_DURATION_US,
            max_buffer_duration_us: MAX_BUFFER_DURATION_US,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            discontinuity_threshold_us: DISCONTINUITY_THRESHOLD_US,
            volume_step: DEFAULT_VOLUME_STEP,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/sinkclock/config.toml on Linux)
    /// 3. User config file (~/.config/sinkclock/config.toml on Linux)
    /// 4. Environment variables (SINKCLOCK_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config.merge_from_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config.merge_from_file(&user_path)?;
            }
        }

        config.apply_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Load a single file on top of the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.merge_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| SinkClockError::Config("Cannot determine user config path".to_string()))?;
        self.save_to(&path)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).config_err("Failed to create config directory")?;
        }

        let toml = toml::to_string_pretty(self).config_err("Failed to serialize config")?;
        std::fs::write(path, toml).config_err("Failed to write config file")?;

        Ok(())
    }

    /// Merge configuration from a TOML file
    fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).config_err("Failed to read config file")?;
        self.merge_from_str(&contents)
    }

    /// Merge a TOML document key by key into the current values
    fn merge_from_str(&mut self, contents: &str) -> Result<()> {
        let overlay: toml::Table = toml::from_str(contents).config_err("Failed to parse config file")?;

        let mut base = match toml::Value::try_from(&*self).config_err("Failed to serialize config")? {
            toml::Value::Table(table) => table,
            _ => return Err(SinkClockError::Config("Config is not a table".to_string())),
        };
        merge_tables(&mut base, overlay);

        *self = toml::Value::Table(base)
            .try_into::<Config>()
            .config_err("Failed to parse config file")?;
        Ok(())
    }

    /// Apply overrides looked up by environment variable name
    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(rate) = lookup("SINKCLOCK_SAMPLE_RATE") {
            self.output.sample_rate = rate
                .parse()
                .map_err(|_| SinkClockError::Config("Invalid SINKCLOCK_SAMPLE_RATE".to_string()))?;
        }

        if let Some(channels) = lookup("SINKCLOCK_CHANNELS") {
            self.output.channels = channels
                .parse()
                .map_err(|_| SinkClockError::Config("Invalid SINKCLOCK_CHANNELS".to_string()))?;
        }

        if let Some(log_level) = lookup("SINKCLOCK_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !(8_000..=192_000).contains(&self.output.sample_rate) {
            return Err(SinkClockError::Config(format!(
                "Sample rate {} out of range 8000..=192000",
                self.output.sample_rate
            )));
        }

        if !(1..=8).contains(&self.output.channels) {
            return Err(SinkClockError::Config("Channel count must be between 1 and 8".to_string()));
        }

        if self.buffer.multiplication_factor == 0 {
            return Err(SinkClockError::Config("Buffer multiplication factor must be non-zero".to_string()));
        }

        if self.buffer.min_buffer_duration_us <= 0
            || self.buffer.min_buffer_duration_us > self.buffer.max_buffer_duration_us
        {
            return Err(SinkClockError::Config(
                "Buffer durations must satisfy 0 < min <= max".to_string(),
            ));
        }

        if !(self.sync.volume_step > 0.0 && self.sync.volume_step <= 1.0) {
            return Err(SinkClockError::Config("Volume step must be in (0.0, 1.0]".to_string()));
        }

        if self.sync.discontinuity_threshold_us < 0 {
            return Err(SinkClockError::Config("Discontinuity threshold must not be negative".to_string()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(SinkClockError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// Output channel mask derived from the configured channel count
    pub fn channel_mask(&self) -> ChannelMask {
        ChannelMask::from_channel_count(self.output.channels)
    }

    /// Runtime options for an `AudioSinkSession`
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            buffer_multiplication_factor: self.buffer.multiplication_factor as usize,
            min_buffer_duration_us: self.buffer.min_buffer_duration_us,
            max_buffer_duration_us: self.buffer.max_buffer_duration_us,
            discontinuity_threshold_us: self.sync.discontinuity_threshold_us,
            volume_step: self.sync.volume_step,
            session_id: self.output.session_id,
            ..SessionOptions::default()
        }
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/sinkclock/config.toml"));

        #[cfg(target_os = "windows")]
        return std::env::var("PROGRAMDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("sinkclock").join("config.toml"));

        #[cfg(target_os = "macos")]
        return Some(PathBuf::from("/Library/Application Support/sinkclock/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sinkclock").join("config.toml"))
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.output.sample_rate, 44_100);
        assert_eq!(config.output.channels, 2);
        assert_eq!(config.buffer.multiplication_factor, 2);
        assert_eq!(config.sync.discontinuity_threshold_us, 100_000);
        assert_eq!(config.sync.volume_step, 0.25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.output.sample_rate = 1_000;
        assert!(config.validate().is_err());

        config.output.sample_rate = 48_000;
        config.output.channels = 0;
        assert!(config.validate().is_err());

        config.output.channels = 2;
        config.buffer.min_buffer_duration_us = 800_000;
        assert!(config.validate().is_err());

        config.buffer.min_buffer_duration_us = 50_000;
        config.sync.volume_step = 0.0;
        assert!(config.validate().is_err());

        config.sync.volume_step = 0.5;
        config.general.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_merge_keeps_other_keys() {
        let mut config = Config::default();
        config.output.channels = 1;

        config
            .merge_from_str("[output]\nsample_rate = 48000\n\n[sync]\nvolume_step = 0.5\n")
            .unwrap();

        assert_eq!(config.output.sample_rate, 48_000);
        assert_eq!(config.output.channels, 1);
        assert_eq!(config.sync.volume_step, 0.5);
        assert_eq!(config.sync.discontinuity_threshold_us, 100_000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides_from(|key| match key {
                "SINKCLOCK_SAMPLE_RATE" => Some("48000".to_string()),
                "SINKCLOCK_LOG_LEVEL" => Some("debug".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.output.sample_rate, 48_000);
        assert_eq!(config.general.log_level, "debug");

        let err = config.apply_overrides_from(|key| {
            (key == "SINKCLOCK_CHANNELS").then(|| "two".to_string())
        });
        assert!(matches!(err, Err(SinkClockError::Config(_))));
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.output.session_id = Some(7);
        let toml = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_session_options_projection() {
        let mut config = Config::default();
        config.sync.volume_step = 0.5;
        config.output.session_id = Some(3);

        let options = config.session_options();
        assert_eq!(options.volume_step, 0.5);
        assert_eq!(options.session_id, Some(3));
        assert_eq!(options.min_buffer_duration_us, 50_000);
        assert_eq!(config.channel_mask(), ChannelMask::STEREO);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.buffer.max_buffer_duration_us = 500_000;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }
}
