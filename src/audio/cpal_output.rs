//! CPAL playback sink
//!
//! Implements `PlaybackSink` on top of a cpal output stream. A cpal
//! `Stream` cannot leave the thread that built it, so every sink owns a
//! small host thread that builds the stream and then serves play/pause
//! commands until release. PCM reaches the audio callback through a
//! `ringbuf` SPSC ring sized to the session buffer.
//!
//! The frame counter is the number of frames the callback has pulled from
//! the ring. Every callback also publishes a hardware timestamp: the first
//! frame of the callback buffer is presented after the device's reported
//! playback delay.

use crate::audio::clock::Clock;
use crate::audio::sink::{
    HardwareTimestamp, PlayState, PlaybackSink, SinkFactory, SinkParams, SinkState,
    ERROR_DEAD_OBJECT, ERROR_INVALID_OPERATION,
};
use crate::audio::{ChannelMask, PcmEncoding};
use crate::utils::error::{IntoSinkError, Result, SinkClockError};
use crate::utils::{duration_us_to_frames, frames_to_duration_us};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer as _, Observer as _, Producer as _, Split as _};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Smallest device period we ask the factory to report
const MIN_DEVICE_PERIOD_US: i64 = 20_000;

/// Sleep between attempts of a blocking write
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// How long `create()` waits for the host thread to build the stream
const STREAM_BUILD_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands served by the stream host thread
enum StreamCommand {
    Play(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
    Release,
}

/// State shared with the audio callback
struct CallbackShared {
    playing: AtomicBool,
    failed: AtomicBool,
    frames_consumed: AtomicU64,
    /// Samples to drop before the next read
    discard_samples: AtomicU64,
    /// `f32` bits
    volume: AtomicU32,
    device_delay_us: AtomicI64,
    timestamp: Mutex<Option<HardwareTimestamp>>,
}

impl CallbackShared {
    fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            frames_consumed: AtomicU64::new(0),
            discard_samples: AtomicU64::new(0),
            volume: AtomicU32::new(1.0f32.to_bits()),
            device_delay_us: AtomicI64::new(0),
            timestamp: Mutex::new(None),
        }
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Fill one callback buffer from the ring
    fn render(
        &self,
        data: &mut [f32],
        consumer: &mut HeapCons<f32>,
        channels: usize,
        presented_at_us: i64,
        delay_us: i64,
    ) {
        let discard = self.discard_samples.swap(0, Ordering::AcqRel) as usize;
        if discard > 0 {
            consumer.skip(discard.min(consumer.occupied_len()));
        }

        if !self.playing.load(Ordering::Acquire) {
            data.fill(0.0);
            return;
        }

        let before = self.frames_consumed.load(Ordering::Acquire);
        if let Some(mut slot) = self.timestamp.try_lock() {
            *slot = Some(HardwareTimestamp {
                position_frames: before,
                system_time_us: presented_at_us,
            });
        }
        self.device_delay_us.store(delay_us, Ordering::Relaxed);

        let read = consumer.pop_slice(data);
        data[read..].fill(0.0);
        let gain = self.volume();
        for sample in &mut data[..read] {
            *sample *= gain;
        }

        self.frames_consumed
            .fetch_add((read / channels.max(1)) as u64, Ordering::AcqRel);
    }
}

/// Decode interleaved PCM bytes into `f32` samples
fn decode_samples(pcm: &[u8], encoding: PcmEncoding) -> Vec<f32> {
    match encoding {
        PcmEncoding::Pcm16Bit => pcm
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
            .collect(),
        PcmEncoding::PcmFloat => pcm
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

/// Build the stream on the current thread and serve commands until release
fn run_stream_host(
    params: SinkParams,
    shared: Arc<CallbackShared>,
    mut consumer: HeapCons<f32>,
    clock: Arc<dyn Clock>,
    ready: Sender<Result<()>>,
    commands: Receiver<StreamCommand>,
) {
    let channels = params.channel_mask.channel_count() as usize;
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready.send(Err(SinkClockError::device("No default output device found")));
        return;
    };

    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let callback_shared = Arc::clone(&shared);
    let error_shared = Arc::clone(&shared);
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
            let ts = info.timestamp();
            let delay = ts
                .playback
                .duration_since(&ts.callback)
                .unwrap_or(Duration::ZERO);
            let delay_us = delay.as_micros() as i64;
            callback_shared.render(data, &mut consumer, channels, clock.now_us() + delay_us, delay_us);
        },
        move |err| {
            error!("Audio stream error: {}", err);
            error_shared.failed.store(true, Ordering::Release);
        },
        None,
    );

    let stream = match stream.device_err("Failed to create audio stream") {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Some hosts start streams on creation
    if let Err(e) = stream.pause() {
        debug!("Initial stream pause not supported: {}", e);
    }
    if ready.send(Ok(())).is_err() {
        return;
    }

    for command in commands.iter() {
        match command {
            StreamCommand::Play(reply) => {
                let _ = reply.send(stream.play().device_err("Failed to start audio stream"));
            }
            StreamCommand::Pause(reply) => {
                let _ = reply.send(stream.pause().device_err("Failed to pause audio stream"));
            }
            StreamCommand::Release => break,
        }
    }
    debug!("Audio stream host exiting");
}

/// Playback sink backed by the default cpal output device
pub struct CpalSink {
    params: SinkParams,
    state: SinkState,
    shared: Arc<CallbackShared>,
    producer: Mutex<Option<HeapProd<f32>>>,
    play_state: Mutex<PlayState>,
    commands: Sender<StreamCommand>,
    host_thread: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl CpalSink {
    /// Open a stream for `params` on its own host thread
    ///
    /// A device that refuses the configuration yields a sink in
    /// `SinkState::Uninitialized`; only a failure to spawn the host thread
    /// is an error.
    pub fn open(params: SinkParams, clock: Arc<dyn Clock>) -> Result<Self> {
        let bytes_per_sample = params.encoding.bytes_per_sample();
        let capacity = (params.buffer_size / bytes_per_sample).max(1);
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

        let shared = Arc::new(CallbackShared::new());
        let (ready_tx, ready_rx) = bounded(1);
        let (command_tx, command_rx) = unbounded();

        let host_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                run_stream_host(params, host_shared, consumer, clock, ready_tx, command_rx)
            })
            .device_err("Failed to spawn audio stream thread")?;

        let state = match ready_rx.recv_timeout(STREAM_BUILD_TIMEOUT) {
            Ok(Ok(())) => {
                info!(
                    "Opened cpal stream: {}Hz, {} channels, {} byte buffer",
                    params.sample_rate,
                    params.channel_mask.channel_count(),
                    params.buffer_size
                );
                SinkState::Initialized
            }
            Ok(Err(e)) => {
                warn!("cpal stream rejected: {}", e);
                SinkState::Uninitialized
            }
            Err(e) => {
                warn!("cpal stream did not come up: {}", e);
                SinkState::Uninitialized
            }
        };

        Ok(Self {
            params,
            state,
            shared,
            producer: Mutex::new(Some(producer)),
            play_state: Mutex::new(PlayState::Stopped),
            commands: command_tx,
            host_thread: Mutex::new(Some(handle)),
            released: AtomicBool::new(false),
        })
    }

    fn is_usable(&self) -> bool {
        self.state == SinkState::Initialized && !self.released.load(Ordering::Acquire)
    }

    fn send_command(&self, make: fn(Sender<Result<()>>) -> StreamCommand) -> Result<()> {
        if !self.is_usable() {
            return Err(SinkClockError::device("cpal sink is not usable"));
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(make(reply_tx))
            .device_err("Audio stream thread is gone")?;
        reply_rx.recv().device_err("Audio stream thread is gone")?
    }

    fn buffer_duration_us(&self) -> i64 {
        let frame_size = self.params.channel_mask.channel_count() as usize
            * self.params.encoding.bytes_per_sample();
        let frames = self.params.buffer_size / frame_size.max(1);
        frames_to_duration_us(frames as i64, self.params.sample_rate)
    }
}

impl PlaybackSink for CpalSink {
    fn state(&self) -> SinkState {
        self.state
    }

    fn play_state(&self) -> PlayState {
        *self.play_state.lock()
    }

    fn session_id(&self) -> Option<i32> {
        self.params.session_id
    }

    fn write(&self, pcm: &[u8]) -> isize {
        if self.released.load(Ordering::Acquire) || self.shared.failed.load(Ordering::Acquire) {
            return ERROR_DEAD_OBJECT;
        }
        if self.state != SinkState::Initialized {
            return ERROR_INVALID_OPERATION;
        }

        let channels = self.params.channel_mask.channel_count() as usize;
        let bytes_per_sample = self.params.encoding.bytes_per_sample();
        let frame_size = channels * bytes_per_sample;
        let whole = pcm.len() - pcm.len() % frame_size;
        let samples = decode_samples(&pcm[..whole], self.params.encoding);

        let mut producer = self.producer.lock();
        let Some(producer) = producer.as_mut() else {
            return ERROR_DEAD_OBJECT;
        };

        let mut pushed = 0;
        while pushed < samples.len() {
            let room = producer.vacant_len() / channels * channels;
            let count = room.min(samples.len() - pushed);
            if count > 0 {
                pushed += producer.push_slice(&samples[pushed..pushed + count]);
                continue;
            }
            if *self.play_state.lock() != PlayState::Playing
                || self.released.load(Ordering::Acquire)
                || self.shared.failed.load(Ordering::Acquire)
            {
                break;
            }
            thread::sleep(WRITE_RETRY_INTERVAL);
        }

        (pushed * bytes_per_sample) as isize
    }

    fn raw_frame_position(&self) -> u32 {
        self.shared.frames_consumed.load(Ordering::Acquire) as u32
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        if !self.is_usable() {
            return Err(SinkClockError::device("cpal sink is not usable"));
        }
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn hardware_timestamp(&self) -> Option<HardwareTimestamp> {
        if !self.is_usable() || *self.play_state.lock() == PlayState::Stopped {
            return None;
        }
        *self.shared.timestamp.lock()
    }

    fn latency_us(&self) -> Result<i64> {
        if !self.is_usable() {
            return Err(SinkClockError::device("cpal sink is not usable"));
        }
        Ok(self.shared.device_delay_us.load(Ordering::Relaxed) + self.buffer_duration_us())
    }

    fn play(&self) -> Result<()> {
        self.send_command(StreamCommand::Play)?;
        self.shared.playing.store(true, Ordering::Release);
        *self.play_state.lock() = PlayState::Playing;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.shared.playing.store(false, Ordering::Release);
        self.send_command(StreamCommand::Pause)?;
        *self.play_state.lock() = PlayState::Paused;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if !self.is_usable() {
            return Err(SinkClockError::device("cpal sink is not usable"));
        }
        if *self.play_state.lock() == PlayState::Playing {
            return Ok(());
        }
        if let Some(producer) = self.producer.lock().as_ref() {
            let queued = producer.occupied_len() as u64;
            self.shared.discard_samples.store(queued, Ordering::Release);
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.playing.store(false, Ordering::Release);
        *self.play_state.lock() = PlayState::Stopped;
        *self.shared.timestamp.lock() = None;
        self.producer.lock().take();

        let _ = self.commands.send(StreamCommand::Release);
        if let Some(handle) = self.host_thread.lock().take() {
            handle
                .join()
                .map_err(|_| SinkClockError::Internal("audio stream thread panicked".to_string()))?;
        }
        info!("Released cpal stream");
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            let _ = self.commands.send(StreamCommand::Release);
        }
    }
}

/// Creates `CpalSink`s on the default output device
pub struct CpalSinkFactory {
    clock: Arc<dyn Clock>,
}

impl CpalSinkFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl SinkFactory for CpalSinkFactory {
    fn minimum_buffer_size(
        &self,
        sample_rate: u32,
        channel_mask: ChannelMask,
        encoding: PcmEncoding,
    ) -> Option<usize> {
        let host = cpal::default_host();
        let device = host.default_output_device()?;
        let channels = channel_mask.channel_count();
        let configs = match device.supported_output_configs() {
            Ok(configs) => configs,
            Err(e) => {
                warn!("Failed to query output configs: {}", e);
                return None;
            }
        };

        let supported = configs.into_iter().find(|c| {
            c.channels() == channels
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate().0 <= sample_rate
                && sample_rate <= c.max_sample_rate().0
        })?;

        let device_min = match supported.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } => *min as i64,
            cpal::SupportedBufferSize::Unknown => 0,
        };
        let frames = device_min.max(duration_us_to_frames(MIN_DEVICE_PERIOD_US, sample_rate));
        Some(frames as usize * channels as usize * encoding.bytes_per_sample())
    }

    fn create(&self, params: &SinkParams) -> Result<Arc<dyn PlaybackSink>> {
        let sink = CpalSink::open(*params, Arc::clone(&self.clock))?;
        Ok(Arc::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> (HeapProd<f32>, HeapCons<f32>) {
        HeapRb::<f32>::new(capacity).split()
    }

    #[test]
    fn test_decode_pcm16() {
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0xFF, 0x7F];
        let samples = decode_samples(&bytes, PcmEncoding::Pcm16Bit);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.5);
        assert_eq!(samples[1], -0.5);
        assert!(samples[2] > 0.99);
    }

    #[test]
    fn test_decode_float_ignores_partial_sample() {
        let mut bytes = 0.25f32.to_le_bytes().to_vec();
        bytes.push(0xAA);
        assert_eq!(decode_samples(&bytes, PcmEncoding::PcmFloat), vec![0.25]);
    }

    #[test]
    fn test_render_silent_when_not_playing() {
        let shared = CallbackShared::new();
        let (mut producer, mut consumer) = ring(16);
        producer.push_slice(&[0.5; 8]);

        let mut data = [1.0f32; 4];
        shared.render(&mut data, &mut consumer, 2, 1_000, 500);

        assert_eq!(data, [0.0; 4]);
        assert_eq!(shared.frames_consumed.load(Ordering::Acquire), 0);
        assert!(shared.timestamp.lock().is_none());
    }

    #[test]
    fn test_render_counts_frames_and_applies_volume() {
        let shared = CallbackShared::new();
        shared.playing.store(true, Ordering::Release);
        shared.volume.store(0.5f32.to_bits(), Ordering::Relaxed);
        let (mut producer, mut consumer) = ring(16);
        producer.push_slice(&[1.0; 6]);

        let mut data = [9.0f32; 8];
        shared.render(&mut data, &mut consumer, 2, 2_000, 700);

        assert_eq!(data, [0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(shared.frames_consumed.load(Ordering::Acquire), 3);
        assert_eq!(shared.device_delay_us.load(Ordering::Relaxed), 700);
        assert_eq!(
            *shared.timestamp.lock(),
            Some(HardwareTimestamp {
                position_frames: 0,
                system_time_us: 2_000
            })
        );

        shared.render(&mut data, &mut consumer, 2, 3_000, 700);
        assert_eq!(shared.timestamp.lock().map(|t| t.position_frames), Some(3));
    }

    #[test]
    fn test_render_discards_flushed_samples() {
        let shared = CallbackShared::new();
        let (mut producer, mut consumer) = ring(16);
        producer.push_slice(&[1.0; 4]);
        shared.discard_samples.store(4, Ordering::Release);
        producer.push_slice(&[0.25; 2]);
        shared.playing.store(true, Ordering::Release);

        let mut data = [9.0f32; 4];
        shared.render(&mut data, &mut consumer, 2, 0, 0);

        assert_eq!(data, [0.25, 0.25, 0.0, 0.0]);
        assert_eq!(shared.frames_consumed.load(Ordering::Acquire), 1);
    }
}
