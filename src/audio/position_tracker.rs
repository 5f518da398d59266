//! Playback position tracking
//!
//! Reconciles the sink's wrapping 32-bit frame counter with polled hardware
//! timestamps to produce a smooth, monotonic estimate of the frame being
//! heard. Call [`PlaybackClockTracker::attach`] whenever a sink is created,
//! [`PlaybackClockTracker::start`] right before the sink starts playing,
//! and [`PlaybackClockTracker::reset`] before the sink goes away.

use crate::audio::clock::Clock;
use crate::audio::sink::{PlayState, PlaybackSink};
use crate::audio::timestamp_poller::{PollerState, TimestampPoller};
use crate::audio::AudioSessionConfig;
use crate::utils::{frames_to_duration_us, MICROS_PER_SECOND};
use log::{debug, warn};
use std::sync::Arc;

/// Timestamps further than this from the system clock or the frame counter are spurious
const MAX_AUDIO_TIMESTAMP_OFFSET_US: i64 = 5 * MICROS_PER_SECOND;

/// Latencies above this are treated as bogus
const MAX_LATENCY_US: i64 = 5 * MICROS_PER_SECOND;

/// How long the counter may stay frozen while playing before the sink counts as stalled
const FORCE_RESET_WORKAROUND_TIMEOUT_US: i64 = 200_000;

const MAX_PLAYHEAD_OFFSET_COUNT: usize = 10;
const MIN_PLAYHEAD_OFFSET_SAMPLE_INTERVAL_US: i64 = 30_000;
const MIN_LATENCY_SAMPLE_INTERVAL_US: i64 = 500_000;

/// End-of-stream markers
#[derive(Debug, Clone, Copy)]
struct EndOfStream {
    stop_timestamp_us: i64,
    stop_position: i64,
    end_position: i64,
}

/// Position tracker for one sink at a time
pub struct PlaybackClockTracker {
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn PlaybackSink>>,
    poller: Option<TimestampPoller>,

    sample_rate: u32,
    output_frame_size: usize,
    buffer_size: usize,
    buffer_size_us: i64,

    playhead_offsets: [i64; MAX_PLAYHEAD_OFFSET_COUNT],
    playhead_offset_count: usize,
    next_playhead_offset_index: usize,
    smoothed_playhead_offset_us: i64,
    last_playhead_sample_time_us: Option<i64>,

    /// Cleared for good once the sink's latency query fails
    latency_enabled: bool,
    latency_us: i64,
    last_latency_sample_time_us: Option<i64>,

    last_raw_position: u64,
    raw_wrap_count: u64,
    written_frames: i64,
    end_of_stream: Option<EndOfStream>,
    force_reset_time_us: Option<i64>,
}

impl PlaybackClockTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sink: None,
            poller: None,
            sample_rate: 0,
            output_frame_size: 0,
            buffer_size: 0,
            buffer_size_us: 0,
            playhead_offsets: [0; MAX_PLAYHEAD_OFFSET_COUNT],
            playhead_offset_count: 0,
            next_playhead_offset_index: 0,
            smoothed_playhead_offset_us: 0,
            last_playhead_sample_time_us: None,
            latency_enabled: true,
            latency_us: 0,
            last_latency_sample_time_us: None,
            last_raw_position: 0,
            raw_wrap_count: 0,
            written_frames: 0,
            end_of_stream: None,
            force_reset_time_us: None,
        }
    }

    /// Track a newly created sink, dropping all state from the previous one
    pub fn attach(&mut self, sink: Arc<dyn PlaybackSink>, config: &AudioSessionConfig) {
        self.poller = Some(TimestampPoller::new(Arc::clone(&sink)));
        self.sink = Some(sink);
        self.sample_rate = config.sample_rate;
        self.output_frame_size = config.output_frame_size;
        self.buffer_size = config.buffer_size;
        self.buffer_size_us = config.buffer_duration_us();

        self.reset_sync_params();
        self.latency_us = 0;
        self.last_latency_sample_time_us = None;
        self.last_raw_position = 0;
        self.raw_wrap_count = 0;
        self.written_frames = 0;
        self.end_of_stream = None;
        self.force_reset_time_us = None;
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Estimated playback position in microseconds since the sink started
    pub fn current_position_us(&mut self) -> i64 {
        let Some(sink) = self.sink.clone() else {
            return 0;
        };

        if sink.play_state() == PlayState::Playing {
            self.maybe_sample_sync_params();
        }

        let now_us = self.clock.now_us();
        if let Some(poller) = self.poller.as_ref().filter(|p| p.has_timestamp()) {
            let timestamp_position_us =
                frames_to_duration_us(poller.position_frames() as i64, self.sample_rate);
            if !poller.is_advancing() {
                return timestamp_position_us;
            }
            return timestamp_position_us + (now_us - poller.system_time_us());
        }

        let position_us = if self.playhead_offset_count == 0 {
            // Started, but nothing sampled yet
            self.playback_head_position_us()
        } else {
            // The raw counter only moves in coarse steps, so follow the system clock instead
            now_us + self.smoothed_playhead_offset_us
        };
        position_us - self.latency_us
    }

    /// Restart timestamp polling; call right before the sink starts playing
    pub fn start(&mut self) {
        if let Some(poller) = self.poller.as_mut() {
            poller.reset();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.sink
            .as_ref()
            .is_some_and(|sink| sink.play_state() == PlayState::Playing)
    }

    /// Record how much has been written before handing another buffer to the sink
    ///
    /// Reading the counter here keeps the stall detection running even when
    /// nobody asks for the position. Returns whether data is still pending.
    pub fn update_pending_data(&mut self, written_frames: i64) -> bool {
        self.written_frames = written_frames;
        self.has_pending_data(written_frames)
    }

    /// Whether the sink still has frames to play out
    pub fn has_pending_data(&mut self, written_frames: i64) -> bool {
        written_frames > self.playback_head_position()
    }

    /// Bytes that fit into the sink buffer right now
    pub fn available_buffer_bytes(&mut self, written_bytes: u64) -> i64 {
        let head_bytes = self.playback_head_position() * self.output_frame_size as i64;
        let pending = written_bytes as i64 - head_bytes;
        self.buffer_size as i64 - pending
    }

    /// Whether the sink must be recreated
    pub fn is_stalled(&self, written_frames: i64) -> bool {
        written_frames > 0 && self.stalled_for_us() >= FORCE_RESET_WORKAROUND_TIMEOUT_US
    }

    /// How long the counter has been frozen, in milliseconds
    pub fn stalled_for_ms(&self) -> i64 {
        self.stalled_for_us() / 1000
    }

    fn stalled_for_us(&self) -> i64 {
        self.force_reset_time_us
            .map_or(0, |armed| self.clock.now_us() - armed)
    }

    /// Record that no more data will be written
    ///
    /// The reported position keeps advancing in real time from here until it
    /// reaches `written_frames`.
    pub fn handle_end_of_stream(&mut self, written_frames: i64) {
        let stop_position = self.playback_head_position();
        self.end_of_stream = Some(EndOfStream {
            stop_timestamp_us: self.clock.now_us(),
            stop_position,
            end_position: written_frames,
        });
        debug!(
            "End of stream at frame {} of {}",
            stop_position, written_frames
        );
    }

    /// Prepare for a pause; returns whether the sink itself still has to be paused
    pub fn pause(&mut self) -> bool {
        self.reset_sync_params();
        if self.end_of_stream.is_none() {
            // Avoid reporting an advancing timestamp while paused
            if let Some(poller) = self.poller.as_mut() {
                poller.reset();
            }
            return true;
        }
        false
    }

    /// Detach from the sink
    pub fn reset(&mut self) {
        self.reset_sync_params();
        self.sink = None;
        self.poller = None;
    }

    /// Hardware and mixer latency, excluding the sink buffer
    pub fn latency_us(&self) -> i64 {
        self.latency_us
    }

    pub fn poller_state(&self) -> Option<PollerState> {
        self.poller.as_ref().map(TimestampPoller::state)
    }

    /// Playback head position in frames as a 64-bit count
    pub fn playback_head_position(&mut self) -> i64 {
        let Some(sink) = self.sink.clone() else {
            return 0;
        };

        if let Some(eos) = self.end_of_stream {
            let elapsed_us = self.clock.now_us() - eos.stop_timestamp_us;
            let frames_since_stop = elapsed_us * self.sample_rate as i64 / MICROS_PER_SECOND;
            return eos.end_position.min(eos.stop_position + frames_since_stop);
        }

        let state = sink.play_state();
        if state == PlayState::Stopped {
            return 0;
        }

        let raw = u64::from(sink.raw_frame_position());
        if state == PlayState::Playing && self.last_raw_position > 0 {
            // A sink can claim to be playing while its counter dropped to zero or
            // stopped moving with data still queued. Hold the last value and let
            // the stall timer decide.
            let frozen = raw == self.last_raw_position
                && self.written_frames > self.combine_raw_position(raw);
            if raw == 0 || frozen {
                let now_us = self.clock.now_us();
                if self.force_reset_time_us.is_none() {
                    debug!("Frame counter stuck at {}", self.last_raw_position);
                    self.force_reset_time_us = Some(now_us);
                }
                return self.combine_raw_position(self.last_raw_position);
            }
        }
        self.force_reset_time_us = None;

        if self.last_raw_position > raw {
            self.raw_wrap_count += 1;
        }
        self.last_raw_position = raw;
        self.combine_raw_position(raw)
    }

    fn combine_raw_position(&self, raw: u64) -> i64 {
        (raw + (self.raw_wrap_count << 32)) as i64
    }

    fn playback_head_position_us(&mut self) -> i64 {
        let frames = self.playback_head_position();
        frames_to_duration_us(frames, self.sample_rate)
    }

    fn maybe_sample_sync_params(&mut self) {
        let playback_position_us = self.playback_head_position_us();
        if playback_position_us == 0 {
            // Nothing output yet
            return;
        }

        let now_us = self.clock.now_us();
        let due = self
            .last_playhead_sample_time_us
            .map_or(true, |last| now_us - last >= MIN_PLAYHEAD_OFFSET_SAMPLE_INTERVAL_US);
        if due {
            self.playhead_offsets[self.next_playhead_offset_index] = playback_position_us - now_us;
            self.next_playhead_offset_index =
                (self.next_playhead_offset_index + 1) % MAX_PLAYHEAD_OFFSET_COUNT;
            if self.playhead_offset_count < MAX_PLAYHEAD_OFFSET_COUNT {
                self.playhead_offset_count += 1;
            }
            self.last_playhead_sample_time_us = Some(now_us);

            let count = self.playhead_offset_count as i64;
            self.smoothed_playhead_offset_us = self.playhead_offsets[..self.playhead_offset_count]
                .iter()
                .map(|offset| offset / count)
                .sum();
        }

        self.maybe_poll_and_check_timestamp(now_us, playback_position_us);
        self.maybe_update_latency(now_us);
    }

    fn maybe_poll_and_check_timestamp(&mut self, now_us: i64, playback_position_us: i64) {
        let sample_rate = self.sample_rate;
        let Some(poller) = self.poller.as_mut() else {
            return;
        };
        if !poller.maybe_poll(now_us) {
            return;
        }
        let Some(sample) = poller.pending() else {
            return;
        };

        let timestamp_position_us = frames_to_duration_us(sample.position_frames as i64, sample_rate);
        if (sample.system_time_us - now_us).abs() > MAX_AUDIO_TIMESTAMP_OFFSET_US {
            warn!(
                "Spurious timestamp (system clock mismatch): {}, {}, {}, {}",
                sample.position_frames, sample.system_time_us, now_us, playback_position_us
            );
            poller.reject();
        } else if (timestamp_position_us - playback_position_us).abs() > MAX_AUDIO_TIMESTAMP_OFFSET_US
        {
            warn!(
                "Spurious timestamp (frame position mismatch): {}, {}, {}, {}",
                sample.position_frames, sample.system_time_us, now_us, playback_position_us
            );
            poller.reject();
        } else {
            poller.accept();
        }
    }

    fn maybe_update_latency(&mut self, now_us: i64) {
        if !self.latency_enabled {
            return;
        }
        if let Some(last) = self.last_latency_sample_time_us {
            if now_us - last < MIN_LATENCY_SAMPLE_INTERVAL_US {
                return;
            }
        }
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        match sink.latency_us() {
            Ok(total_us) => {
                // Keep only mixer and driver latency
                let latency_us = (total_us - self.buffer_size_us).max(0);
                self.latency_us = if latency_us > MAX_LATENCY_US { 0 } else { latency_us };
            }
            Err(e) => {
                debug!("Latency query unavailable, not trying again: {}", e);
                self.latency_enabled = false;
            }
        }
        self.last_latency_sample_time_us = Some(now_us);
    }

    fn reset_sync_params(&mut self) {
        self.smoothed_playhead_offset_us = 0;
        self.playhead_offset_count = 0;
        self.next_playhead_offset_index = 0;
        self.last_playhead_sample_time_us = None;
    }
}
