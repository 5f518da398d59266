//! Concurrent use of one session from a writer thread and async control code

use anyhow::Result;
use sinkclock::audio::{AudioSinkSession, ChannelMask, SystemClock, VirtualSinkFactory};
use sinkclock_integration_tests::position_trace::PositionTrace;
use sinkclock_integration_tests::{pcm, SAMPLE_RATE, WAIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writer_and_control_run_concurrently() -> Result<()> {
    let clock = Arc::new(SystemClock::new());
    let factory = Arc::new(VirtualSinkFactory::new(clock.clone()));
    factory.set_blocking_writes(true);
    let probe = factory.probe();
    let session = Arc::new(AudioSinkSession::new(factory, clock));
    session.init(SAMPLE_RATE, ChannelMask::STEREO)?;
    session.play()?;

    let stop = Arc::new(AtomicBool::new(false));
    let writer = tokio::task::spawn_blocking({
        let session = session.clone();
        let stop = stop.clone();
        move || -> sinkclock::Result<u64> {
            let chunk = pcm(480);
            let mut pts = 0;
            let mut written = 0u64;
            while !stop.load(Ordering::Acquire) {
                let accepted = session.write(&chunk, pts)?;
                if accepted == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                written += accepted as u64;
                pts += accepted as i64 / 4 * 1_000_000 / i64::from(SAMPLE_RATE);
            }
            Ok(written)
        }
    });

    let mut trace = PositionTrace::new();
    for i in 0..30 {
        sleep(Duration::from_millis(10)).await;
        if let Some(position) = session.current_position_us() {
            trace.record(position);
        }
        if i == 15 {
            session.pause();
            session.play()?;
        }
    }

    stop.store(true, Ordering::Release);
    let written = writer.await??;

    session.release();
    assert!(session.wait_for_release(WAIT));

    assert!(written > 0);
    assert_eq!(session.stats().bytes_written, written);
    assert!(!trace.is_empty());
    assert!(trace.last().unwrap_or(-1) >= 0);
    assert_eq!(probe.max_live(), 1);
    Ok(())
}
