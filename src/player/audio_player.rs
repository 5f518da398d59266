//! Feeder thread and shared presentation clock

use crate::audio::{AudioSinkSession, ChannelMask, MasterClock};
use crate::player::{PcmChunk, PcmSource};
use crate::utils::error::{IntoSinkError, Result, SinkClockError};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Size of the buffer handed to the source
pub const AUDIO_BUFFER_SIZE: usize = 4096;

/// Sleep while paused or starved
const IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// Session positions down to this much below zero still count as valid
const POSITION_EPSILON_US: i64 = 1_000;

/// State shared between the control methods and the writer thread
struct FeederState {
    playing: bool,
    stop_requested: bool,
    source: Option<Box<dyn PcmSource>>,
}

struct Shared {
    session: Arc<AudioSinkSession>,
    master_clock: Arc<MasterClock>,
    feeder: Mutex<FeederState>,
}

impl Shared {
    fn should_feed(&self) -> bool {
        let feeder = self.feeder.lock();
        feeder.playing && !feeder.stop_requested
    }

    /// Writer thread body
    fn run(&self) {
        let mut buf = vec![0u8; AUDIO_BUFFER_SIZE];
        loop {
            let mut feeder = self.feeder.lock();
            if feeder.stop_requested {
                break;
            }
            if !feeder.playing {
                drop(feeder);
                thread::sleep(IDLE_INTERVAL);
                continue;
            }

            buf.fill(0);
            let render_position_us = self.master_clock.get_pts();
            let chunk = match feeder.source.as_mut() {
                Some(source) => source.fill(&mut buf, render_position_us),
                None => PcmChunk::EMPTY,
            };
            drop(feeder);

            let len = chunk.len.min(buf.len());
            if len == 0 {
                thread::sleep(IDLE_INTERVAL);
                continue;
            }
            self.write_chunk(&buf[..len], chunk.presentation_time_us);
        }
        debug!("Audio feeder exiting");
    }

    /// Write one chunk, following up partial writes while still playing
    fn write_chunk(&self, pcm: &[u8], presentation_time_us: i64) {
        let mut offset = 0;
        let mut pts = presentation_time_us;
        while offset < pcm.len() {
            match self.session.write(&pcm[offset..], pts) {
                Ok(accepted) => {
                    offset += accepted;
                    if let Some(config) = self.session.config() {
                        pts += config.frames_to_duration_us(config.bytes_to_frames(accepted as u64));
                    }
                    if offset < pcm.len() {
                        if !self.should_feed() {
                            break;
                        }
                        if accepted == 0 {
                            thread::sleep(IDLE_INTERVAL);
                        }
                    }
                }
                Err(e) => {
                    warn!("Dropping {} bytes of audio: {}", pcm.len() - offset, e);
                    thread::sleep(IDLE_INTERVAL);
                    break;
                }
            }
        }
    }
}

/// Streams a `PcmSource` through a session on a dedicated thread
pub struct AudioPlayer {
    shared: Arc<Shared>,
    writer: Option<thread::JoinHandle<()>>,
    position_listener: Mutex<Option<Sender<i64>>>,
}

impl AudioPlayer {
    pub fn new(session: Arc<AudioSinkSession>, master_clock: Arc<MasterClock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                session,
                master_clock,
                feeder: Mutex::new(FeederState {
                    playing: false,
                    stop_requested: false,
                    source: None,
                }),
            }),
            writer: None,
            position_listener: Mutex::new(None),
        }
    }

    /// Initialize the session and start the writer thread
    ///
    /// Initialization is attempted up to `retries` times, backing off a
    /// little longer after every failure.
    pub fn init(&mut self, sample_rate: u32, channel_mask: ChannelMask, retries: u32) -> Result<()> {
        if self.writer.is_some() {
            return Err(SinkClockError::InvalidInput(
                "audio player is already initialized".to_string(),
            ));
        }

        let attempts = retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.session.init(sample_rate, channel_mask) {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    warn!("Sink init attempt {}/{} failed: {}", attempt, attempts, e);
                    thread::sleep(Duration::from_millis(10 * (u64::from(attempt) + 1)));
                }
                Err(e) => return Err(e),
            }
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("audio-feeder".to_string())
            .spawn(move || shared.run())
            .internal_err("Failed to spawn audio feeder")?;
        self.writer = Some(handle);
        info!("Audio player ready after {} attempt(s)", attempt);
        Ok(())
    }

    /// Replace the PCM source
    pub fn set_source(&self, source: Box<dyn PcmSource>) {
        self.shared.feeder.lock().source = Some(source);
    }

    /// Receive every position reported by `current_time_us()`
    pub fn set_position_listener(&self, listener: Sender<i64>) {
        *self.position_listener.lock() = Some(listener);
    }

    pub fn play(&self) -> Result<()> {
        if self.writer.is_none() {
            return Err(SinkClockError::InvalidInput(
                "audio player is not initialized".to_string(),
            ));
        }
        let mut feeder = self.shared.feeder.lock();
        feeder.playing = true;
        self.shared.session.play()
    }

    pub fn pause(&self) {
        let mut feeder = self.shared.feeder.lock();
        if self.writer.is_some() {
            feeder.playing = false;
        }
        self.shared.session.pause();
    }

    /// Drop queued audio; playback resumes with a fade-in
    pub fn flush(&self) {
        let _feeder = self.shared.feeder.lock();
        self.shared.session.flush();
    }

    pub fn is_playing(&self) -> bool {
        self.writer.is_some() && self.shared.feeder.lock().playing
    }

    /// Presentation time being heard
    ///
    /// Uses the session position while playing and the master clock
    /// otherwise. The answer is written back to the master clock and
    /// sent to the position listener.
    pub fn current_time_us(&self) -> i64 {
        let feeder = self.shared.feeder.lock();
        let mut position_us = self.shared.master_clock.get_pts();
        if feeder.playing {
            if let Some(session_us) = self.shared.session.current_position_us() {
                if session_us > -POSITION_EPSILON_US {
                    position_us = session_us;
                }
            }
        }
        drop(feeder);

        self.shared.master_clock.set_pts(position_us);
        let mut listener = self.position_listener.lock();
        if let Some(tx) = listener.as_ref() {
            if let Err(TrySendError::Disconnected(_)) = tx.try_send(position_us) {
                *listener = None;
            }
        }
        position_us
    }

    pub fn session(&self) -> &Arc<AudioSinkSession> {
        &self.shared.session
    }

    pub fn master_clock(&self) -> &Arc<MasterClock> {
        &self.shared.master_clock
    }

    /// Stop the writer thread and release the session
    pub fn release(&mut self) {
        self.shared.feeder.lock().stop_requested = true;
        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                warn!("Audio feeder panicked");
            }
        }
        self.shared.session.release();
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.release();
    }
}
