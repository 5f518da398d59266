//! Integration tests for the sink session
//!
//! These tests drive a session over the virtual sink in simulated time:
//! - Presentation-time resynchronization
//! - Flush with fade-in
//! - Recovery from a stalled frame counter
//! - Single device instance across background releases

use anyhow::Result;
use sinkclock::audio::{ChannelMask, PlayState, PlaybackSink, SessionStatus, SyncState};
use sinkclock_integration_tests::position_trace::PositionTrace;
use sinkclock_integration_tests::{frames_us, TestFixture, SAMPLE_RATE, WAIT};
use std::thread;
use std::time::Duration;

fn started_without_timestamps() -> Result<TestFixture> {
    let fixture = TestFixture::new();
    fixture.factory.set_timestamps_supported(false);
    fixture.session.init(SAMPLE_RATE, ChannelMask::STEREO)?;
    fixture.session.play()?;
    Ok(fixture)
}

#[test]
fn test_discontinuity_resyncs_anchor() -> Result<()> {
    let f = started_without_timestamps()?;

    f.write_frames(1_920, 0)?;
    f.advance_ms(20);
    assert_eq!(f.session.current_position_us(), Some(20_000));

    // Small jitter in presentation times is absorbed
    f.write_frames(480, 40_000 + 50_000)?;
    assert_eq!(f.session.stats().discontinuities, 0);
    assert_eq!(f.session.clock_state().start_media_time_us, 0);

    // A seek-sized jump moves the anchor by the difference
    f.write_frames(480, 1_000_000)?;
    let state = f.session.clock_state();
    assert_eq!(f.session.stats().discontinuities, 1);
    assert_eq!(state.sync_state, SyncState::InSync);
    assert_eq!(state.start_media_time_us, 1_000_000 - frames_us(2_400));
    assert_eq!(
        f.session.current_position_us(),
        Some(1_000_000 - frames_us(2_400) + 20_000)
    );
    Ok(())
}

#[test]
fn test_position_advances_with_playback() -> Result<()> {
    let f = started_without_timestamps()?;
    let mut trace = PositionTrace::new();

    let mut pts = 500_000;
    for _ in 0..30 {
        f.write_frames(480, pts)?;
        pts += 10_000;
        f.advance_ms(10);
        if let Some(position) = f.session.current_position_us() {
            trace.record(position);
        }
    }

    assert_eq!(trace.len(), 30);
    assert!(trace.is_monotonic());
    assert!(trace.max_step_us() <= 10_000);
    assert_eq!(trace.last(), Some(800_000));
    Ok(())
}

#[test]
fn test_flush_restarts_with_fade_in() -> Result<()> {
    let f = started_without_timestamps()?;
    f.write_frames(960, 0)?;
    f.advance_ms(10);
    let first = f.probe.latest().unwrap();

    f.session.flush();
    assert_eq!(f.session.current_position_us(), None);
    assert_eq!(f.session.clock_state().written_bytes, 0);

    for i in 0..5 {
        f.write_frames(480, 5_000_000 + i * 10_000)?;
    }
    let second = f.probe.latest().unwrap();
    assert!(f.session.wait_for_release(WAIT));

    assert!(first.is_released());
    assert_eq!(second.volumes(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    assert_eq!(second.play_state(), PlayState::Playing);
    assert_eq!(f.session.current_position_us(), Some(5_000_000));
    Ok(())
}

#[test]
fn test_dropped_counter_recovers_on_fresh_sink() -> Result<()> {
    let f = started_without_timestamps()?;
    f.write_frames(960, 0)?;
    f.advance_ms(10);
    f.write_frames(960, 20_000)?;

    f.probe.latest().unwrap().drop_position_to_zero(true);
    f.advance_ms(10);
    f.write_frames(480, 40_000)?;
    assert_eq!(f.session.stats().stall_recoveries, 0);

    f.advance_ms(200);
    f.write_frames(480, 50_000)?;
    let stats = f.session.stats();
    assert_eq!(stats.stall_recoveries, 1);
    assert!(stats.last_error.unwrap().contains("stalled"));
    assert!(f.session.is_playing());

    f.write_frames(480, 260_000)?;
    assert!(f.session.wait_for_release(WAIT));
    assert_eq!(f.probe.created(), 2);
    assert_eq!(f.probe.released(), 1);

    // The device keeps its audio session across the recreation
    let fresh = f.probe.latest().unwrap();
    assert_eq!(fresh.session_id(), Some(1));
    assert_eq!(fresh.play_state(), PlayState::Playing);
    assert_eq!(f.session.current_position_us(), Some(260_000));
    Ok(())
}

#[test]
fn test_release_gate_keeps_one_instance() -> Result<()> {
    let f = TestFixture::initialized()?;
    f.write_frames(480, 0)?;

    let hold = f.probe.hold_releases();
    f.session.release();
    assert_eq!(f.session.status(), SessionStatus::Releasing);

    let session = f.session.clone();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let init = thread::spawn(move || {
        let _ = done_tx.send(session.init(SAMPLE_RATE, ChannelMask::STEREO).is_ok());
    });

    // The new sink waits for the old one to be gone
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(f.probe.live(), 1);
    assert_eq!(f.probe.created(), 1);

    drop(hold);
    assert!(done_rx.recv_timeout(WAIT)?);
    init.join().expect("init thread panicked");

    assert_eq!(f.probe.created(), 2);
    assert_eq!(f.probe.max_live(), 1);
    assert_eq!(f.session.status(), SessionStatus::Initialized);
    Ok(())
}

#[test]
fn test_end_of_stream_drains_tail() -> Result<()> {
    let f = started_without_timestamps()?;
    f.write_frames(2_400, 100_000)?;
    f.advance_ms(10);

    f.session.handle_end_of_stream();
    f.session.pause();
    assert!(f.session.has_pending_data());

    f.advance_ms(20);
    assert!(f.session.has_pending_data());
    f.advance_ms(30);
    assert!(!f.session.has_pending_data());
    Ok(())
}
