//! Software playback sink
//!
//! `VirtualSink` consumes frames at its sample rate against a [`Clock`],
//! exactly like a device would, without producing any sound. Driven by a
//! `ManualClock` it makes the whole engine deterministic; driven by the
//! `SystemClock` it paces a real-time stream.
//!
//! It also reproduces the device misbehaviour the tracker has to cope with:
//! frozen or dropped frame counters, counters close to the 32-bit wrap,
//! missing or skewed timestamps, failing latency queries, failing writes and
//! rejected creation. `VirtualSinkFactory` hands out sinks and records them
//! in a shared [`SinkProbe`].

use crate::audio::clock::Clock;
use crate::audio::sink::{
    HardwareTimestamp, PlayState, PlaybackSink, SinkFactory, SinkParams, SinkState,
    ERROR_DEAD_OBJECT,
};
use crate::audio::{ChannelMask, PcmEncoding};
use crate::utils::error::{Result, SinkClockError};
use crate::utils::{duration_us_to_frames, frames_to_duration_us};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Minimum buffer reported by the factory
const MIN_DEVICE_BUFFER_US: i64 = 40_000;

/// How often the simulated device refreshes its timestamp
const DEFAULT_TIMESTAMP_PERIOD_US: i64 = 10_000;

/// Sleep between retries of a blocking write
const BLOCKING_WRITE_POLL: Duration = Duration::from_millis(2);

/// Mutable device state
#[derive(Debug)]
struct Playback {
    play_state: PlayState,
    written_frames: u64,
    consumed_base: u64,
    playing_since_us: Option<i64>,
    volume_history: Vec<f32>,
    frozen_position: Option<u32>,
    position_dropped: bool,
    position_offset: u32,
    timestamps_supported: bool,
    timestamp_period_us: i64,
    timestamp_skew_us: i64,
    timestamp_frame_offset: i64,
    latency_supported: bool,
    extra_latency_us: i64,
    write_error: Option<isize>,
    blocking_writes: bool,
    flushes: usize,
    released: bool,
}

impl Playback {
    fn new() -> Self {
        Self {
            play_state: PlayState::Stopped,
            written_frames: 0,
            consumed_base: 0,
            playing_since_us: None,
            volume_history: Vec::new(),
            frozen_position: None,
            position_dropped: false,
            position_offset: 0,
            timestamps_supported: true,
            timestamp_period_us: DEFAULT_TIMESTAMP_PERIOD_US,
            timestamp_skew_us: 0,
            timestamp_frame_offset: 0,
            latency_supported: true,
            extra_latency_us: 0,
            write_error: None,
            blocking_writes: false,
            flushes: 0,
            released: false,
        }
    }

    /// Frames played out by `now_us`
    fn consumed_at(&self, now_us: i64, sample_rate: u32) -> u64 {
        match self.playing_since_us {
            Some(since) if now_us > since => {
                let elapsed = duration_us_to_frames(now_us - since, sample_rate) as u64;
                (self.consumed_base + elapsed).min(self.written_frames)
            }
            _ => self.consumed_base,
        }
    }

    /// Restart consumption from `now_us` after the buffer ran dry
    fn rebase_if_starved(&mut self, now_us: i64, sample_rate: u32) {
        if self.play_state == PlayState::Playing
            && self.consumed_at(now_us, sample_rate) >= self.written_frames
        {
            self.consumed_base = self.written_frames;
            self.playing_since_us = Some(now_us);
        }
    }

    /// Freeze consumption at `now_us`
    fn settle(&mut self, now_us: i64, sample_rate: u32) {
        self.consumed_base = self.consumed_at(now_us, sample_rate);
        self.playing_since_us = None;
    }
}

/// A clock-driven software sink
pub struct VirtualSink {
    params: SinkParams,
    clock: Arc<dyn Clock>,
    state: SinkState,
    session_id: Option<i32>,
    frame_size: usize,
    capacity_frames: u64,
    playback: Mutex<Playback>,
    probe: Option<Weak<SinkProbe>>,
}

impl VirtualSink {
    /// Create an initialized sink
    pub fn new(params: SinkParams, clock: Arc<dyn Clock>) -> Self {
        Self::build(params, clock, SinkState::Initialized, params.session_id, None)
    }

    fn build(
        params: SinkParams,
        clock: Arc<dyn Clock>,
        state: SinkState,
        session_id: Option<i32>,
        probe: Option<Weak<SinkProbe>>,
    ) -> Self {
        let frame_size =
            (params.channel_mask.channel_count() as usize * params.encoding.bytes_per_sample()).max(1);
        Self {
            params,
            clock,
            state,
            session_id,
            frame_size,
            capacity_frames: (params.buffer_size / frame_size) as u64,
            playback: Mutex::new(Playback::new()),
            probe,
        }
    }

    pub fn params(&self) -> &SinkParams {
        &self.params
    }

    /// Frames accepted since creation (minus flushed ones)
    pub fn written_frames(&self) -> u64 {
        self.playback.lock().written_frames
    }

    /// Frames played out so far
    pub fn consumed_frames(&self) -> u64 {
        let now_us = self.clock.now_us();
        self.playback.lock().consumed_at(now_us, self.params.sample_rate)
    }

    /// Every volume applied, in order
    pub fn volumes(&self) -> Vec<f32> {
        self.playback.lock().volume_history.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.playback.lock().flushes
    }

    pub fn is_released(&self) -> bool {
        self.playback.lock().released
    }

    /// Hold the frame counter at its current value
    pub fn freeze_position(&self) {
        let raw = self.raw_frame_position();
        self.playback.lock().frozen_position = Some(raw);
    }

    pub fn unfreeze_position(&self) {
        self.playback.lock().frozen_position = None;
    }

    /// Make the frame counter read zero
    pub fn drop_position_to_zero(&self, dropped: bool) {
        self.playback.lock().position_dropped = dropped;
    }

    /// Start the frame counter at `offset` instead of zero
    pub fn set_position_offset(&self, offset: u32) {
        self.playback.lock().position_offset = offset;
    }

    pub fn set_timestamps_supported(&self, supported: bool) {
        self.playback.lock().timestamps_supported = supported;
    }

    /// How often the device refreshes its timestamp
    pub fn set_timestamp_period_us(&self, period_us: i64) {
        self.playback.lock().timestamp_period_us = period_us.max(1);
    }

    /// Shift reported timestamp times away from the clock
    pub fn set_timestamp_skew_us(&self, skew_us: i64) {
        self.playback.lock().timestamp_skew_us = skew_us;
    }

    /// Shift reported timestamp positions away from the counter
    pub fn set_timestamp_frame_offset(&self, frames: i64) {
        self.playback.lock().timestamp_frame_offset = frames;
    }

    pub fn set_latency_supported(&self, supported: bool) {
        self.playback.lock().latency_supported = supported;
    }

    /// Latency on top of the buffer duration
    pub fn set_extra_latency_us(&self, latency_us: i64) {
        self.playback.lock().extra_latency_us = latency_us;
    }

    /// Make every write return `code` (negative) until cleared
    pub fn fail_writes(&self, code: Option<isize>) {
        self.playback.lock().write_error = code;
    }

    /// Block writes while the buffer is full and playing
    pub fn set_blocking_writes(&self, blocking: bool) {
        self.playback.lock().blocking_writes = blocking;
    }

    fn buffer_duration_us(&self) -> i64 {
        frames_to_duration_us(self.capacity_frames as i64, self.params.sample_rate)
    }

    fn ensure_alive(&self, playback: &Playback, op: &str) -> Result<()> {
        if playback.released {
            return Err(SinkClockError::device(format!("{} on a released sink", op)));
        }
        if self.state != SinkState::Initialized {
            return Err(SinkClockError::device(format!("{} on an uninitialized sink", op)));
        }
        Ok(())
    }
}

impl PlaybackSink for VirtualSink {
    fn state(&self) -> SinkState {
        self.state
    }

    fn play_state(&self) -> PlayState {
        self.playback.lock().play_state
    }

    fn session_id(&self) -> Option<i32> {
        self.session_id
    }

    fn write(&self, pcm: &[u8]) -> isize {
        let rate = self.params.sample_rate;
        let offered = (pcm.len() / self.frame_size) as u64;
        let mut playback = self.playback.lock();

        loop {
            if playback.released {
                return ERROR_DEAD_OBJECT;
            }
            if let Some(code) = playback.write_error {
                return code;
            }

            let now_us = self.clock.now_us();
            playback.rebase_if_starved(now_us, rate);
            let queued = playback.written_frames - playback.consumed_at(now_us, rate);
            let free = self.capacity_frames.saturating_sub(queued);

            let wait = free == 0
                && offered > 0
                && playback.blocking_writes
                && playback.play_state == PlayState::Playing;
            if !wait {
                let accepted = free.min(offered);
                playback.written_frames += accepted;
                trace!("Virtual sink accepted {} of {} frames", accepted, offered);
                return (accepted as usize * self.frame_size) as isize;
            }

            MutexGuard::unlocked(&mut playback, || std::thread::sleep(BLOCKING_WRITE_POLL));
        }
    }

    fn raw_frame_position(&self) -> u32 {
        let now_us = self.clock.now_us();
        let playback = self.playback.lock();
        if let Some(frozen) = playback.frozen_position {
            return frozen;
        }
        if playback.position_dropped {
            return 0;
        }
        let consumed = playback.consumed_at(now_us, self.params.sample_rate);
        (consumed + u64::from(playback.position_offset)) as u32
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        let mut playback = self.playback.lock();
        self.ensure_alive(&playback, "set_volume")?;
        playback.volume_history.push(volume.clamp(0.0, 1.0));
        Ok(())
    }

    fn hardware_timestamp(&self) -> Option<HardwareTimestamp> {
        let now_us = self.clock.now_us();
        let playback = self.playback.lock();
        if !playback.timestamps_supported
            || playback.released
            || playback.play_state == PlayState::Stopped
        {
            return None;
        }

        let period = playback.timestamp_period_us;
        let mut sample_time_us = now_us - now_us.rem_euclid(period);
        if let Some(since) = playback.playing_since_us {
            sample_time_us = sample_time_us.max(since);
        }

        let position_frames = match playback.frozen_position {
            Some(frozen) => u64::from(frozen),
            None => {
                playback.consumed_at(sample_time_us, self.params.sample_rate)
                    + u64::from(playback.position_offset)
            }
        };

        let position_frames = position_frames.saturating_add_signed(playback.timestamp_frame_offset);

        Some(HardwareTimestamp {
            position_frames,
            system_time_us: sample_time_us + playback.timestamp_skew_us,
        })
    }

    fn latency_us(&self) -> Result<i64> {
        let playback = self.playback.lock();
        if !playback.latency_supported {
            return Err(SinkClockError::Unsupported("latency query".to_string()));
        }
        Ok(self.buffer_duration_us() + playback.extra_latency_us)
    }

    fn play(&self) -> Result<()> {
        let now_us = self.clock.now_us();
        let mut playback = self.playback.lock();
        self.ensure_alive(&playback, "play")?;
        if playback.play_state != PlayState::Playing {
            playback.settle(now_us, self.params.sample_rate);
            playback.playing_since_us = Some(now_us);
            playback.play_state = PlayState::Playing;
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let now_us = self.clock.now_us();
        let mut playback = self.playback.lock();
        self.ensure_alive(&playback, "pause")?;
        playback.settle(now_us, self.params.sample_rate);
        playback.play_state = PlayState::Paused;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut playback = self.playback.lock();
        if playback.released {
            return Err(SinkClockError::device("flush on a released sink"));
        }
        // Like a real device, flushing while playing does nothing
        if playback.play_state != PlayState::Playing {
            playback.written_frames = playback.consumed_base;
            playback.flushes += 1;
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let probe = self.probe.as_ref().and_then(Weak::upgrade);
        if let Some(hold) = probe.as_ref().and_then(|p| p.release_hold()) {
            // Sender fired or dropped
            let _ = hold.recv();
        }

        let first_release = {
            let mut playback = self.playback.lock();
            let first = !playback.released;
            playback.released = true;
            playback.play_state = PlayState::Stopped;
            playback.playing_since_us = None;
            first
        };

        if first_release {
            debug!("Virtual sink {:?} released", self.session_id);
            if let Some(probe) = probe {
                probe.record_release();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct ProbeState {
    sinks: Vec<Arc<VirtualSink>>,
    released: usize,
    live: usize,
    max_live: usize,
    release_hold: Option<Receiver<()>>,
}

/// Records every sink a `VirtualSinkFactory` created
#[derive(Default)]
pub struct SinkProbe {
    state: Mutex<ProbeState>,
}

impl SinkProbe {
    pub fn created(&self) -> usize {
        self.state.lock().sinks.len()
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    /// Sinks created and not yet released
    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    /// Highest number of simultaneously live sinks seen
    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }

    pub fn sinks(&self) -> Vec<Arc<VirtualSink>> {
        self.state.lock().sinks.clone()
    }

    /// The most recently created sink
    pub fn latest(&self) -> Option<Arc<VirtualSink>> {
        self.state.lock().sinks.last().cloned()
    }

    /// Make releases wait until the returned sender sends or is dropped
    pub fn hold_releases(&self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        self.state.lock().release_hold = Some(rx);
        tx
    }

    fn release_hold(&self) -> Option<Receiver<()>> {
        self.state.lock().release_hold.clone()
    }

    fn record_created(&self, sink: &Arc<VirtualSink>) {
        let mut state = self.state.lock();
        state.sinks.push(Arc::clone(sink));
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
    }

    fn record_release(&self) {
        let mut state = self.state.lock();
        state.released += 1;
        state.live = state.live.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Copy)]
struct FactorySettings {
    format_supported: bool,
    reject_creation: bool,
    fail_creation: bool,
    timestamps_supported: bool,
    blocking_writes: bool,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            format_supported: true,
            reject_creation: false,
            fail_creation: false,
            timestamps_supported: true,
            blocking_writes: false,
        }
    }
}

/// Creates `VirtualSink`s sharing one clock
pub struct VirtualSinkFactory {
    clock: Arc<dyn Clock>,
    probe: Arc<SinkProbe>,
    settings: Mutex<FactorySettings>,
    next_session_id: AtomicI32,
}

impl VirtualSinkFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            probe: Arc::new(SinkProbe::default()),
            settings: Mutex::new(FactorySettings::default()),
            next_session_id: AtomicI32::new(1),
        }
    }

    pub fn probe(&self) -> Arc<SinkProbe> {
        Arc::clone(&self.probe)
    }

    /// Report every format as unsupported
    pub fn set_format_supported(&self, supported: bool) {
        self.settings.lock().format_supported = supported;
    }

    /// Create sinks in the uninitialized state
    pub fn set_reject_creation(&self, reject: bool) {
        self.settings.lock().reject_creation = reject;
    }

    /// Fail creation outright
    pub fn set_fail_creation(&self, fail: bool) {
        self.settings.lock().fail_creation = fail;
    }

    pub fn set_timestamps_supported(&self, supported: bool) {
        self.settings.lock().timestamps_supported = supported;
    }

    pub fn set_blocking_writes(&self, blocking: bool) {
        self.settings.lock().blocking_writes = blocking;
    }
}

impl SinkFactory for VirtualSinkFactory {
    fn minimum_buffer_size(
        &self,
        sample_rate: u32,
        channel_mask: ChannelMask,
        encoding: PcmEncoding,
    ) -> Option<usize> {
        if !self.settings.lock().format_supported || sample_rate == 0 {
            return None;
        }
        let channels = channel_mask.channel_count() as usize;
        if channels == 0 {
            return None;
        }
        let frames = duration_us_to_frames(MIN_DEVICE_BUFFER_US, sample_rate) as usize;
        Some(frames * channels * encoding.bytes_per_sample())
    }

    fn create(&self, params: &SinkParams) -> Result<Arc<dyn PlaybackSink>> {
        let settings = *self.settings.lock();
        if settings.fail_creation {
            return Err(SinkClockError::device(format!(
                "virtual device refused {}Hz {:?}",
                params.sample_rate, params.channel_mask
            )));
        }

        let session_id = params
            .session_id
            .unwrap_or_else(|| self.next_session_id.fetch_add(1, Ordering::SeqCst));
        let state = if settings.reject_creation {
            SinkState::Uninitialized
        } else {
            SinkState::Initialized
        };

        let sink = Arc::new(VirtualSink::build(
            *params,
            Arc::clone(&self.clock),
            state,
            Some(session_id),
            Some(Arc::downgrade(&self.probe)),
        ));
        sink.set_timestamps_supported(settings.timestamps_supported);
        sink.set_blocking_writes(settings.blocking_writes);
        self.probe.record_created(&sink);

        debug!(
            "Created virtual sink {}: {}Hz, {} channels, {} bytes",
            session_id,
            params.sample_rate,
            params.channel_mask.channel_count(),
            params.buffer_size
        );
        Ok(sink)
    }
}
