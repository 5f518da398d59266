//! Integration tests for the pull-driven audio player
//!
//! These run against a virtual sink paced by the system clock.

use anyhow::Result;
use sinkclock::audio::{
    AudioSinkSession, ChannelMask, MasterClock, SessionStatus, SystemClock, VirtualSinkFactory,
};
use sinkclock::player::{AudioPlayer, PcmChunk};
use sinkclock_integration_tests::position_trace::PositionTrace;
use sinkclock_integration_tests::{frames_us, SAMPLE_RATE, WAIT};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn player() -> (AudioPlayer, Arc<VirtualSinkFactory>) {
    let clock = Arc::new(SystemClock::new());
    let factory = Arc::new(VirtualSinkFactory::new(clock.clone()));
    let session = Arc::new(AudioSinkSession::new(factory.clone(), clock));
    (AudioPlayer::new(session, Arc::new(MasterClock::new())), factory)
}

/// Endless stream of 480-frame chunks starting at `start_us`
fn stream_from(start_us: i64) -> impl FnMut(&mut [u8], i64) -> PcmChunk + Send {
    let mut next_us = start_us;
    move |_buf: &mut [u8], _render_us: i64| {
        let chunk = PcmChunk {
            len: 1_920,
            presentation_time_us: next_us,
        };
        next_us += frames_us(480);
        chunk
    }
}

#[test]
fn test_reported_time_follows_playback() -> Result<()> {
    let (mut player, _factory) = player();
    player.init(SAMPLE_RATE, ChannelMask::STEREO, 3)?;
    player.set_source(Box::new(stream_from(2_000_000)));
    player.play()?;

    let (tx, rx) = crossbeam_channel::unbounded();
    player.set_position_listener(tx);

    let mut trace = PositionTrace::new();
    for _ in 0..20 {
        thread::sleep(Duration::from_millis(10));
        trace.record(player.current_time_us());
    }

    assert_eq!(rx.try_iter().count(), 20);
    let last = trace.last().unwrap_or(0);
    assert!(last >= 2_000_000, "position {last} before stream start");
    assert!(last < 3_000_000, "position {last} ran ahead of playback");
    assert_eq!(player.master_clock().get_pts(), last);
    Ok(())
}

#[test]
fn test_pause_freezes_reported_time() -> Result<()> {
    let (mut player, _factory) = player();
    player.init(SAMPLE_RATE, ChannelMask::STEREO, 3)?;
    player.set_source(Box::new(stream_from(0)));
    player.play()?;
    thread::sleep(Duration::from_millis(50));

    player.pause();
    let paused_at = player.current_time_us();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(player.current_time_us(), paused_at);
    assert_eq!(player.session().status(), SessionStatus::Paused);
    Ok(())
}

#[test]
fn test_drop_stops_feeding_and_releases() -> Result<()> {
    let (mut player, factory) = player();
    let probe = factory.probe();
    player.init(SAMPLE_RATE, ChannelMask::STEREO, 3)?;
    player.set_source(Box::new(stream_from(0)));
    player.play()?;
    thread::sleep(Duration::from_millis(30));

    let session = Arc::clone(player.session());
    drop(player);
    assert!(session.wait_for_release(WAIT));

    let written = session.stats().bytes_written;
    assert!(written > 0);
    assert_eq!(probe.released(), probe.created());
    thread::sleep(Duration::from_millis(30));
    assert_eq!(session.stats().bytes_written, written);
    Ok(())
}
