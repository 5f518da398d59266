use anyhow::Result;
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{error, info};
use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sinkclock::audio::{
    AudioSinkSession, ChannelMask, MasterClock, PcmEncoding, SinkFactory, SystemClock,
    VirtualSinkFactory,
};
use sinkclock::player::{AudioPlayer, PcmChunk, PcmSource};
use sinkclock::utils::{format_position_us, frames_to_duration_us, Config};

/// Output device to stream into
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceKind {
    /// Software sink paced by the system clock
    Virtual,
    /// Default cpal output device
    Cpal,
}

/// sinkclock - stream a test tone and report the playback clock
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output device
    #[arg(long, value_enum, default_value = "virtual")]
    device: DeviceKind,

    /// Configuration file (defaults to the system and user files)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sample rate in Hz, overriding the configuration
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Channel count, overriding the configuration
    #[arg(long)]
    channels: Option<u16>,

    /// Tone frequency in Hz
    #[arg(long, default_value = "440")]
    frequency: f32,

    /// Seconds of audio to stream
    #[arg(long, default_value = "5")]
    duration: u64,

    /// Print the final session statistics as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// 16-bit sine tone, `total_frames` long
struct ToneSource {
    sample_rate: u32,
    channels: usize,
    frequency: f32,
    frame: u64,
    total_frames: u64,
}

impl PcmSource for ToneSource {
    fn fill(&mut self, buf: &mut [u8], _render_position_us: i64) -> PcmChunk {
        let frame_size = self.channels * 2;
        let frames = ((buf.len() / frame_size) as u64).min(self.total_frames - self.frame);
        if frames == 0 {
            return PcmChunk::EMPTY;
        }

        let presentation_time_us = frames_to_duration_us(self.frame as i64, self.sample_rate);
        for (i, frame) in buf.chunks_exact_mut(frame_size).take(frames as usize).enumerate() {
            let t = (self.frame + i as u64) as f32 / self.sample_rate as f32;
            let value = ((TAU * self.frequency * t).sin() * 0.2 * f32::from(i16::MAX)) as i16;
            for sample in frame.chunks_exact_mut(2) {
                sample.copy_from_slice(&value.to_le_bytes());
            }
        }
        self.frame += frames;

        PcmChunk {
            len: frames as usize * frame_size,
            presentation_time_us,
        }
    }
}

fn sink_factory(kind: DeviceKind) -> Result<Arc<dyn SinkFactory>> {
    let clock = Arc::new(SystemClock::new());
    match kind {
        DeviceKind::Virtual => Ok(Arc::new(VirtualSinkFactory::new(clock))),
        #[cfg(feature = "cpal-output")]
        DeviceKind::Cpal => Ok(Arc::new(sinkclock::audio::CpalSinkFactory::new(clock))),
        #[cfg(not(feature = "cpal-output"))]
        DeviceKind::Cpal => Err(anyhow::anyhow!(
            "cpal output is not compiled in, rebuild with --features cpal-output"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(rate) = args.sample_rate {
        config.output.sample_rate = rate;
    }
    if let Some(channels) = args.channels {
        config.output.channels = channels;
    }
    config.validate()?;

    let log_level = if args.debug {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting sinkclock v{}", env!("CARGO_PKG_VERSION"));

    let mut options = config.session_options();
    options.encoding = PcmEncoding::Pcm16Bit;
    let session = Arc::new(AudioSinkSession::with_options(
        sink_factory(args.device)?,
        Arc::new(SystemClock::new()),
        options,
    ));

    let sample_rate = config.output.sample_rate;
    let channel_mask = ChannelMask::from_channel_count(config.output.channels);
    let mut player = AudioPlayer::new(Arc::clone(&session), Arc::new(MasterClock::new()));
    player.set_source(Box::new(ToneSource {
        sample_rate,
        channels: usize::from(config.output.channels),
        frequency: args.frequency,
        frame: 0,
        total_frames: args.duration * u64::from(sample_rate),
    }));
    if let Err(e) = player.init(sample_rate, channel_mask, config.output.init_retries) {
        error!("Failed to initialize audio output: {}", e);
        return Err(e.into());
    }
    player.play()?;

    let (position_tx, position_rx) = crossbeam_channel::unbounded();
    player.set_position_listener(position_tx);

    let end_us = (args.duration * 1_000_000) as i64;
    let started = tokio::time::Instant::now();
    let mut end_of_stream = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let position_us = player.current_time_us();
                let reported = position_rx.try_iter().count();
                info!(
                    "Position {} ({:?}, latency {}us, {} updates)",
                    format_position_us(position_us),
                    session.status(),
                    session.stats().latency_us,
                    reported
                );

                // The tone is written ahead of real time, so it is complete by now
                if !end_of_stream && started.elapsed() >= Duration::from_secs(args.duration) {
                    session.handle_end_of_stream();
                    end_of_stream = true;
                }
                if position_us >= end_us || (end_of_stream && !session.has_pending_data()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    player.pause();
    let stats = session.stats();
    drop(player);
    session.wait_for_release(Duration::from_secs(2));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        info!(
            "Done: {} bytes written, {} discontinuities, {} stall recoveries, {} write failures",
            stats.bytes_written, stats.discontinuities, stats.stall_recoveries, stats.write_failures
        );
    }

    Ok(())
}
