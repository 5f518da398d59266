//! Session behaviour against scripted sinks
//!
//! The sink and factory are mocked to check which device calls the
//! session makes, and how it reports devices that refuse to start.

use anyhow::Result;
use mockall::mock;
use sinkclock::audio::{
    AudioSinkSession, ChannelMask, ManualClock, PcmEncoding, PlayState, PlaybackSink,
    SessionStatus, SinkFactory, SinkParams, SinkState,
};
use sinkclock::SinkClockError;
use sinkclock_integration_tests::{pcm, SAMPLE_RATE, WAIT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mock! {
    pub Factory {}

    impl SinkFactory for Factory {
        fn minimum_buffer_size(
            &self,
            sample_rate: u32,
            channel_mask: ChannelMask,
            encoding: PcmEncoding,
        ) -> Option<usize>;

        fn create(&self, params: &SinkParams) -> sinkclock::Result<Arc<dyn PlaybackSink>>;
    }
}

mock! {
    pub Sink {}

    impl PlaybackSink for Sink {
        fn state(&self) -> SinkState;
        fn play_state(&self) -> PlayState;
        fn write(&self, pcm: &[u8]) -> isize;
        fn raw_frame_position(&self) -> u32;
        fn set_volume(&self, volume: f32) -> sinkclock::Result<()>;
        fn play(&self) -> sinkclock::Result<()>;
        fn pause(&self) -> sinkclock::Result<()>;
        fn flush(&self) -> sinkclock::Result<()>;
        fn release(&self) -> sinkclock::Result<()>;
    }
}

fn session_over(factory: MockFactory) -> AudioSinkSession {
    AudioSinkSession::new(Arc::new(factory), Arc::new(ManualClock::new(0)))
}

fn factory_with_minimum() -> MockFactory {
    let mut factory = MockFactory::new();
    factory
        .expect_minimum_buffer_size()
        .returning(|_, _, _| Some(7_680));
    factory
}

#[test]
fn test_factory_error_is_initialization_failure() {
    let mut factory = factory_with_minimum();
    factory
        .expect_create()
        .times(1)
        .returning(|_| Err(SinkClockError::device("no output device")));
    let session = session_over(factory);

    let err = session.init(SAMPLE_RATE, ChannelMask::STEREO).unwrap_err();
    match err {
        SinkClockError::InitializationFailed {
            requested,
            device_state,
        } => {
            assert_eq!(requested.sample_rate, SAMPLE_RATE);
            assert_eq!(requested.buffer_size, 15_360);
            assert_eq!(device_state, None);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(session.status(), SessionStatus::Uninitialized);
    let stats = session.stats();
    assert_eq!(stats.initializations, 0);
    assert!(stats.last_error.is_some());
}

#[test]
fn test_refused_sink_is_released_and_reported() {
    let mut sink = MockSink::new();
    sink.expect_state().return_const(SinkState::Uninitialized);
    sink.expect_release().times(1).returning(|| Ok(()));

    let mut factory = factory_with_minimum();
    factory
        .expect_create()
        .times(1)
        .return_once(move |_| Ok(Arc::new(sink) as Arc<dyn PlaybackSink>));
    let session = session_over(factory);

    let err = session.init(SAMPLE_RATE, ChannelMask::STEREO).unwrap_err();
    assert!(matches!(
        err,
        SinkClockError::InitializationFailed {
            device_state: Some(SinkState::Uninitialized),
            ..
        }
    ));
    assert_eq!(session.status(), SessionStatus::Uninitialized);
}

#[test]
fn test_session_drives_sink_lifecycle() -> Result<()> {
    let flushes = Arc::new(AtomicUsize::new(0));
    let releases = Arc::new(AtomicUsize::new(0));

    let mut sink = MockSink::new();
    sink.expect_state().return_const(SinkState::Initialized);
    sink.expect_play_state().return_const(PlayState::Playing);
    sink.expect_raw_frame_position().return_const(0u32);
    sink.expect_play().times(1).returning(|| Ok(()));
    sink.expect_write()
        .returning(|pcm: &[u8]| pcm.len() as isize);
    {
        let flushes = flushes.clone();
        sink.expect_flush().returning(move || {
            flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    {
        let releases = releases.clone();
        sink.expect_release().returning(move || {
            releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let mut factory = factory_with_minimum();
    factory
        .expect_create()
        .withf(|params: &SinkParams| {
            params.sample_rate == SAMPLE_RATE && params.buffer_size == 15_360
        })
        .times(1)
        .return_once(move |_| Ok(Arc::new(sink) as Arc<dyn PlaybackSink>));
    let session = session_over(factory);

    session.init(SAMPLE_RATE, ChannelMask::STEREO)?;
    session.play()?;
    session.play()?;
    assert_eq!(session.write(&pcm(480), 0)?, 1_920);
    assert_eq!(session.stats().bytes_written, 1_920);

    session.release();
    assert!(session.wait_for_release(WAIT));
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats().releases, 1);
    Ok(())
}
