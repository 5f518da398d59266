//! Configuration files feeding a session

use anyhow::Result;
use sinkclock::audio::ChannelMask;
use sinkclock::{Config, SinkClockError};
use sinkclock_integration_tests::{TestFixture, SAMPLE_RATE};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_saved_config_loads_back() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("sinkclock").join("config.toml");

    let mut config = Config::default();
    config.output.sample_rate = 48_000;
    config.output.session_id = Some(7);
    config.buffer.multiplication_factor = 4;
    config.sync.volume_step = 0.5;
    config.general.log_level = "debug".to_string();
    config.save_to(&path)?;

    assert!(path.exists());
    assert_eq!(Config::load_from(&path)?, config);
    Ok(())
}

#[test]
fn test_partial_file_keeps_defaults() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("config.toml");
    fs::write(&path, "[sync]\nvolume_step = 0.125\n")?;

    let config = Config::load_from(&path)?;
    assert_eq!(config.sync.volume_step, 0.125);
    assert_eq!(config.output, Config::default().output);
    assert_eq!(config.buffer, Config::default().buffer);
    assert_eq!(config.session_options().volume_step, 0.125);
    Ok(())
}

#[test]
fn test_invalid_file_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("config.toml");
    fs::write(&path, "[output]\nchannels = 12\n")?;

    let err = Config::load_from(&path).unwrap_err();
    assert!(matches!(err, SinkClockError::Config(_)));
    Ok(())
}

#[test]
fn test_session_uses_configured_buffer_factor() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("config.toml");
    fs::write(&path, "[buffer]\nmultiplication_factor = 4\n")?;
    let config = Config::load_from(&path)?;

    let fixture = TestFixture::with_options(config.session_options());
    fixture.session.init(SAMPLE_RATE, ChannelMask::STEREO)?;

    // 40ms device minimum, four times over
    assert_eq!(fixture.session.config().map(|c| c.buffer_size), Some(30_720));
    Ok(())
}
