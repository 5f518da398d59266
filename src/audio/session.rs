//! Audio sink session
//!
//! Owns one playback sink at a time: creates it (lazily, if needed),
//! streams PCM into it, keeps the presentation-time anchor in step with
//! what was written and tears it down in the background on release.
//!
//! Two locks are involved. The control lock guards all session state and
//! the position tracker. The write lock only guards the live sink handle
//! and is held around the blocking device write, so a slow write never
//! holds up `pause()` or `release()` on another thread. The control lock is
//! always taken first when both are needed.

use crate::audio::clock::Clock;
use crate::audio::gate::ReleaseGate;
use crate::audio::position_tracker::PlaybackClockTracker;
use crate::audio::sink::{PlayState, PlaybackSink, SinkFactory, SinkParams, SinkState};
use crate::audio::{
    AudioSessionConfig, ChannelMask, PcmEncoding, BUFFER_MULTIPLICATION_FACTOR,
    DEFAULT_VOLUME_STEP, DISCONTINUITY_THRESHOLD_US, MAX_BUFFER_DURATION_US,
    MIN_BUFFER_DURATION_US,
};
use crate::utils::error::{RequestedConfig, Result, SinkClockError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// State of the presentation-time anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    /// Nothing written since the last reset
    NotSet,

    /// Written frames agree with the caller's timestamps
    InSync,

    /// A discontinuity was seen and the anchor must move
    NeedSync,
}

/// Observable lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Uninitialized,
    Initialized,
    Playing,
    Paused,

    /// No sink, and the previous one is still being torn down
    Releasing,
}

/// Presentation-time bookkeeping for the current sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackClockState {
    /// Bytes accepted by the sink since the last reset
    pub written_bytes: u64,

    /// Presentation time of frame 0
    pub start_media_time_us: i64,

    pub sync_state: SyncState,

    /// Current fade-in volume; negative right after a flush
    pub volume: f32,
}

impl Default for PlaybackClockState {
    fn default() -> Self {
        Self {
            written_bytes: 0,
            start_media_time_us: 0,
            sync_state: SyncState::NotSet,
            volume: 1.0,
        }
    }
}

/// Tunables for a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Factor applied to the sink's minimum buffer size
    pub buffer_multiplication_factor: usize,

    pub min_buffer_duration_us: i64,
    pub max_buffer_duration_us: i64,

    /// Presentation-time deviation that triggers a resync
    pub discontinuity_threshold_us: i64,

    /// Volume increment per write while fading in
    pub volume_step: f32,

    pub encoding: PcmEncoding,

    /// Audio session to join on the first creation
    pub session_id: Option<i32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_multiplication_factor: BUFFER_MULTIPLICATION_FACTOR,
            min_buffer_duration_us: MIN_BUFFER_DURATION_US,
            max_buffer_duration_us: MAX_BUFFER_DURATION_US,
            discontinuity_threshold_us: DISCONTINUITY_THRESHOLD_US,
            volume_step: DEFAULT_VOLUME_STEP,
            encoding: PcmEncoding::default(),
            session_id: None,
        }
    }
}

/// Session diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Sinks successfully created
    pub initializations: u64,

    /// Sinks handed to background teardown
    pub releases: u64,

    /// Presentation-time discontinuities that moved the anchor
    pub discontinuities: u64,

    /// Stalled sinks that were recreated
    pub stall_recoveries: u64,

    /// Writes the sink answered with an error code
    pub write_failures: u64,

    pub bytes_written: u64,

    /// Latest latency estimate, excluding the sink buffer
    pub latency_us: i64,

    pub last_error: Option<String>,
}

/// Everything behind the control lock
struct SessionState {
    config: Option<AudioSessionConfig>,
    sink: Option<Arc<dyn PlaybackSink>>,
    tracker: PlaybackClockTracker,
    clock_state: PlaybackClockState,
    playing: bool,
    paused: bool,
    session_id: Option<i32>,
    stats: SessionStats,
}

impl SessionState {
    fn written_frames(&self) -> i64 {
        self.config
            .map_or(0, |config| config.bytes_to_frames(self.clock_state.written_bytes))
    }

    fn record_error(&mut self, err: &SinkClockError) {
        self.stats.last_error = Some(err.to_string());
    }
}

/// One streaming output with drift-corrected position reporting
pub struct AudioSinkSession {
    factory: Arc<dyn SinkFactory>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    writer: Mutex<Option<Arc<dyn PlaybackSink>>>,
    release_gate: Arc<ReleaseGate>,
    teardown: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AudioSinkSession {
    /// Create a session with default options
    pub fn new(factory: Arc<dyn SinkFactory>, clock: Arc<dyn Clock>) -> Self {
        Self::with_options(factory, clock, SessionOptions::default())
    }

    pub fn with_options(
        factory: Arc<dyn SinkFactory>,
        clock: Arc<dyn Clock>,
        options: SessionOptions,
    ) -> Self {
        let session_id = options.session_id;
        Self {
            factory,
            options,
            state: Mutex::new(SessionState {
                config: None,
                sink: None,
                tracker: PlaybackClockTracker::new(clock),
                clock_state: PlaybackClockState::default(),
                playing: false,
                paused: false,
                session_id,
                stats: SessionStats::default(),
            }),
            writer: Mutex::new(None),
            release_gate: Arc::new(ReleaseGate::default()),
            teardown: Mutex::new(None),
        }
    }

    /// Size the buffer for this format and create a sink
    ///
    /// A sink that already exists is released first. Blocks until any
    /// earlier release has finished.
    pub fn init(&self, sample_rate: u32, channel_mask: ChannelMask) -> Result<()> {
        info!(
            "Initializing sink session: {}Hz, channel mask {:#x}",
            sample_rate,
            channel_mask.bits()
        );
        let encoding = self.options.encoding;
        let unsized_request = RequestedConfig {
            sample_rate,
            channel_mask,
            buffer_size: 0,
        };

        if sample_rate == 0 || channel_mask.channel_count() == 0 {
            return Err(SinkClockError::InitializationFailed {
                requested: unsized_request,
                device_state: None,
            });
        }
        let Some(minimum) = self
            .factory
            .minimum_buffer_size(sample_rate, channel_mask, encoding)
        else {
            error!("Sink does not support {}", unsized_request);
            return Err(SinkClockError::InitializationFailed {
                requested: unsized_request,
                device_state: None,
            });
        };

        let config =
            AudioSessionConfig::new(sample_rate, channel_mask, encoding, minimum, &self.options);
        info!(
            "Sink buffer: frame size {}, minimum {}, size {} bytes ({}us)",
            config.output_frame_size,
            minimum,
            config.buffer_size,
            config.buffer_duration_us()
        );

        let mut state = self.state.lock();
        if state.sink.is_some() {
            self.reset_locked(&mut state);
        }
        state.config = Some(config);
        let result = self.initialize_locked(&mut state);
        if let Err(e) = &result {
            state.record_error(e);
        }
        result
    }

    /// Start playback; does nothing if already playing
    pub fn play(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.playing {
            return Ok(());
        }
        self.play_locked(&mut state)
    }

    /// Pause playback
    ///
    /// Device errors are logged, since a pause can race with a release.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.playing = false;
        let Some(sink) = state.sink.clone() else {
            return;
        };
        state.paused = true;
        let needs_pause = state.tracker.pause();
        drop(state);

        if needs_pause && sink.play_state() == PlayState::Playing {
            if let Err(e) = sink.pause() {
                warn!("Pausing sink failed: {}", e);
            }
        }
    }

    /// Drop everything queued and restart with a fade-in
    ///
    /// The sink is released and recreated on the next write; an in-place
    /// device flush would lose the position baseline.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        debug!("Flushing sink session");
        self.reset_locked(&mut state);
        state.clock_state.volume = -self.options.volume_step;
    }

    /// Write PCM whose first frame should be presented at `presentation_time_us`
    ///
    /// Creates the sink on demand. Returns the number of bytes the sink
    /// accepted, which may be less than offered. A sink error code is
    /// recorded in the stats and reported as 0 bytes.
    pub fn write(&self, pcm: &[u8], presentation_time_us: i64) -> Result<usize> {
        {
            let mut state = self.state.lock();
            if state.sink.is_none() {
                if let Err(e) = self.initialize_locked(&mut state) {
                    error!("Sink re-initialization for write failed: {}", e);
                    state.record_error(&e);
                    return Err(e);
                }
                if state.playing {
                    self.play_locked(&mut state)?;
                }
            }

            let written_frames = state.written_frames();
            state.tracker.update_pending_data(written_frames);
            self.step_volume_locked(&mut state);
            self.sync_presentation_time_locked(&mut state, presentation_time_us);
        }

        // The device write may block; only the handle lock is held
        let result = {
            let writer = self.writer.lock();
            match writer.as_ref() {
                Some(sink) => sink.write(pcm),
                None => 0,
            }
        };

        let mut state = self.state.lock();
        let accepted = if result < 0 {
            let err = SinkClockError::WriteFailed {
                code: result,
                requested: pcm.len(),
            };
            error!("{}", err);
            state.stats.write_failures += 1;
            state.record_error(&err);
            0
        } else {
            (result as usize).min(pcm.len())
        };
        state.clock_state.written_bytes += accepted as u64;
        state.stats.bytes_written += accepted as u64;

        // The write may have blocked for a while; a counter that moved meanwhile is not stalled
        let written_frames = state.written_frames();
        state.tracker.update_pending_data(written_frames);
        if state.tracker.is_stalled(written_frames) {
            let err = SinkClockError::Stalled {
                stalled_for_ms: state.tracker.stalled_for_ms(),
            };
            warn!("Resetting stalled sink: {}", err);
            state.stats.stall_recoveries += 1;
            state.record_error(&err);
            self.reset_locked(&mut state);
        }
        Ok(accepted)
    }

    /// Release the sink in the background
    ///
    /// Returns immediately; the next `init()` or write waits for the
    /// teardown to finish.
    pub fn release(&self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);
        state.tracker.reset();
        state.paused = false;
    }

    /// Presentation time being heard, or `None` before the first write
    pub fn current_position_us(&self) -> Option<i64> {
        let mut state = self.state.lock();
        let config = state.config?;
        if state.sink.is_none() || state.clock_state.sync_state == SyncState::NotSet {
            return None;
        }

        let position_us = state.tracker.current_position_us();
        let written_us = config.frames_to_duration_us(state.written_frames());
        Some(state.clock_state.start_media_time_us + position_us.min(written_us))
    }

    /// Tell the tracker that no more data follows
    pub fn handle_end_of_stream(&self) {
        let mut state = self.state.lock();
        if state.sink.is_none() {
            return;
        }
        let written_frames = state.written_frames();
        state.tracker.handle_end_of_stream(written_frames);
    }

    /// Whether written audio is still waiting to be played
    pub fn has_pending_data(&self) -> bool {
        let mut state = self.state.lock();
        if state.sink.is_none() {
            return false;
        }
        let written_frames = state.written_frames();
        state.tracker.has_pending_data(written_frames)
    }

    /// Bytes that fit into the sink buffer without blocking
    pub fn available_buffer_bytes(&self) -> Option<usize> {
        let mut state = self.state.lock();
        state.sink.as_ref()?;
        let written_bytes = state.clock_state.written_bytes;
        Some(state.tracker.available_buffer_bytes(written_bytes).max(0) as usize)
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock();
        match state.sink {
            None if !self.release_gate.is_open() => SessionStatus::Releasing,
            None => SessionStatus::Uninitialized,
            Some(_) if state.playing => SessionStatus::Playing,
            Some(_) if state.paused => SessionStatus::Paused,
            Some(_) => SessionStatus::Initialized,
        }
    }

    /// Logical playing flag, kept across sink recreation
    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            latency_us: state.tracker.latency_us(),
            ..state.stats.clone()
        }
    }

    pub fn config(&self) -> Option<AudioSessionConfig> {
        self.state.lock().config
    }

    pub fn clock_state(&self) -> PlaybackClockState {
        self.state.lock().clock_state
    }

    /// Audio session id assigned by the device
    pub fn session_id(&self) -> Option<i32> {
        self.state.lock().session_id
    }

    /// Wait for a background release to finish; returns whether it did
    pub fn wait_for_release(&self, timeout: Duration) -> bool {
        if !self.release_gate.block_for(timeout) {
            return false;
        }
        self.join_teardown();
        true
    }

    fn join_teardown(&self) {
        let handle = self.teardown.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Sink release thread panicked");
            }
        }
    }

    fn initialize_locked(&self, state: &mut SessionState) -> Result<()> {
        let Some(config) = state.config else {
            return Err(SinkClockError::InvalidInput(
                "no output format, call init() first".to_string(),
            ));
        };
        let requested = RequestedConfig {
            sample_rate: config.sample_rate,
            channel_mask: config.channel_mask,
            buffer_size: config.buffer_size,
        };

        // At most one device instance at a time
        self.release_gate.block();

        let params = SinkParams {
            sample_rate: config.sample_rate,
            channel_mask: config.channel_mask,
            encoding: config.encoding,
            buffer_size: config.buffer_size,
            session_id: state.session_id,
        };
        let sink = self.factory.create(&params).map_err(|e| {
            error!("Sink creation failed: {}", e);
            SinkClockError::InitializationFailed {
                requested,
                device_state: None,
            }
        })?;

        let device_state = sink.state();
        if device_state != SinkState::Initialized {
            if let Err(e) = sink.release() {
                warn!("Releasing uninitialized sink failed: {}", e);
            }
            return Err(SinkClockError::InitializationFailed {
                requested,
                device_state: Some(device_state),
            });
        }

        if let Some(id) = sink.session_id() {
            if state.session_id != Some(id) {
                info!("Audio session id: {}", id);
                state.session_id = Some(id);
            }
        }

        state.tracker.attach(Arc::clone(&sink), &config);
        state.clock_state.written_bytes = 0;
        state.clock_state.sync_state = SyncState::NotSet;
        state.paused = false;
        *self.writer.lock() = Some(Arc::clone(&sink));
        state.sink = Some(sink);
        state.stats.initializations += 1;
        info!("Sink ready: {}", requested);
        Ok(())
    }

    fn play_locked(&self, state: &mut SessionState) -> Result<()> {
        if let Some(sink) = state.sink.clone() {
            state.tracker.start();
            sink.play()?;
        }
        state.playing = true;
        state.paused = false;
        Ok(())
    }

    fn step_volume_locked(&self, state: &mut SessionState) {
        if state.clock_state.volume >= 1.0 {
            return;
        }
        let volume = (state.clock_state.volume + self.options.volume_step).clamp(0.0, 1.0);
        state.clock_state.volume = volume;
        if let Some(sink) = state.sink.as_ref() {
            if let Err(e) = sink.set_volume(volume) {
                warn!("Setting sink volume to {} failed: {}", volume, e);
            }
        }
    }

    fn sync_presentation_time_locked(&self, state: &mut SessionState, presentation_time_us: i64) {
        let Some(config) = state.config else {
            return;
        };
        let clock_state = &mut state.clock_state;

        if clock_state.sync_state == SyncState::NotSet {
            clock_state.start_media_time_us = presentation_time_us.max(0);
            clock_state.sync_state = SyncState::InSync;
            debug!("Presentation anchor set to {}us", clock_state.start_media_time_us);
            return;
        }

        let written_frames = config.bytes_to_frames(clock_state.written_bytes);
        let expected_us =
            clock_state.start_media_time_us + config.frames_to_duration_us(written_frames);
        if clock_state.sync_state == SyncState::InSync
            && (expected_us - presentation_time_us).abs() > self.options.discontinuity_threshold_us
        {
            warn!(
                "Discontinuity detected [expected {}, got {}], written {} frames",
                expected_us, presentation_time_us, written_frames
            );
            clock_state.sync_state = SyncState::NeedSync;
            state.stats.discontinuities += 1;
        }

        if clock_state.sync_state == SyncState::NeedSync {
            let diff = presentation_time_us - expected_us;
            clock_state.start_media_time_us += diff;
            clock_state.sync_state = SyncState::InSync;
            info!(
                "Presentation anchor moved by {}us to {}us",
                diff, clock_state.start_media_time_us
            );
        }
    }

    /// Forget everything written and release the sink
    fn reset_locked(&self, state: &mut SessionState) {
        state.clock_state.written_bytes = 0;
        state.clock_state.sync_state = SyncState::NotSet;
        if state.sink.is_some() && state.tracker.is_playing() {
            state.tracker.pause();
        }
        self.release_locked(state);
        state.tracker.reset();
        state.paused = false;
    }

    fn release_locked(&self, state: &mut SessionState) {
        let Some(sink) = state.sink.take() else {
            return;
        };
        self.writer.lock().take();
        self.release_gate.close();
        state.stats.releases += 1;
        info!("Releasing sink {:?}", sink.session_id());

        // The previous teardown opened the gate before this sink was created
        self.join_teardown();

        let gate = GateOpener(Arc::clone(&self.release_gate));
        let background = Arc::clone(&sink);
        let spawned = thread::Builder::new()
            .name("sink-release".to_string())
            .spawn(move || {
                let _gate = gate;
                teardown(background.as_ref());
            });

        match spawned {
            Ok(handle) => *self.teardown.lock() = Some(handle),
            Err(e) => {
                // The gate already reopened when the closure was dropped
                warn!("Could not spawn release thread, releasing inline: {}", e);
                teardown(sink.as_ref());
            }
        }
    }
}

impl Drop for AudioSinkSession {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);
        drop(state);
        self.join_teardown();
    }
}

/// Reopens the release gate when dropped
struct GateOpener(Arc<ReleaseGate>);

impl Drop for GateOpener {
    fn drop(&mut self) {
        self.0.open();
    }
}

fn teardown(sink: &dyn PlaybackSink) {
    if let Err(e) = sink.flush() {
        warn!("Flushing released sink failed: {}", e);
    }
    if let Err(e) = sink.release() {
        warn!("Releasing sink failed: {}", e);
    }
}
