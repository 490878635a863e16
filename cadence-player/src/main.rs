//! # Cadence Player
//!
//! Headless player for the Cadence engine. Presentation is driven by a
//! paced tick loop standing in for a display's refresh, and audio is pulled
//! into a virtual device buffer each tick.

mod cli;

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};

use cadence_core::decode::PixelFormat;
use cadence_core::{
    AudioFormat, EngineConfig, Player, PlayerStats, SampleFormat, StreamDescriptor, SyntheticBackend,
    SyntheticClip, SyntheticStream, TickPacer,
};

use cli::{Cli, Commands};

const DEVICE_RATE: u32 = 48_000;
const DEVICE_CHANNELS: u16 = 2;

#[derive(Serialize)]
struct RunReport {
    clip: String,
    ticks: u64,
    frames_shown: u64,
    final_position: f64,
    finished: bool,
    stats: PlayerStats,
}

struct PlayOptions {
    start: f64,
    seek: Option<f64>,
    duration: f64,
    refresh: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "cadence=debug" } else { "cadence=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?)
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Cadence v{} (core {})", env!("CARGO_PKG_VERSION"), cadence_core::VERSION);

    match cli.command {
        Commands::Play {
            input,
            start,
            seek,
            duration,
            refresh,
            looping,
            no_audio,
            speed,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            config.loop_playback |= looping;
            config.decode_audio &= !no_audio;
            if let Some(speed) = speed {
                config.speed = speed;
            }
            config.validate()?;
            let options = PlayOptions {
                start,
                seek,
                duration,
                refresh,
            };
            play(&input, config, &options)
        }
        Commands::Probe { input } => probe(&input),
        Commands::Sample { output, audio, frames } => write_sample(&output, audio, frames),
        Commands::InitConfig { output } => {
            EngineConfig::default().save(&output)?;
            info!("Wrote default config to {}", output.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn play(input: &Path, config: EngineConfig, options: &PlayOptions) -> Result<()> {
    let backend = SyntheticBackend::new();
    let player = Player::open(&backend, input, config)
        .with_context(|| format!("opening {}", input.display()))?;
    info!(
        "{}x{} @ {:?} fps, duration {:?}s, audio: {}",
        player.width(),
        player.height(),
        player.frame_rate(),
        player.duration(),
        player.has_audio()
    );

    let device = AudioFormat::new(DEVICE_RATE, DEVICE_CHANNELS, SampleFormat::F32);
    let mut device_buffer = Vec::new();
    let mut pacer = TickPacer::new(options.refresh);
    let mut frames_shown = 0u64;
    let mut pending_seek = options.seek;
    let began = Instant::now();

    player.start(options.start)?;
    while player.is_playing() && began.elapsed().as_secs_f64() < options.duration {
        let delta = pacer.wait();

        // Virtual device consumes one tick's worth of samples
        let frames = (delta * DEVICE_RATE as f64).round() as usize;
        device_buffer.resize(frames * device.bytes_per_frame(), 0);
        player.fill_audio_buffer(&mut device_buffer, &device);

        if let Some(frame) = player.tick(delta)? {
            frames_shown += 1;
            debug!("tick {}: frame {:?} at {:.3}s", pacer.ticks(), frame.pts, player.current_time());
        }

        if let Some(target) = pending_seek {
            if began.elapsed().as_secs_f64() >= options.duration / 2.0 {
                info!("Seeking to {target:.3}s");
                player.seek(target)?;
                pending_seek = None;
            }
        }
    }

    let finished = !player.is_playing();
    if !finished {
        player.stop(true);
    }
    if let Some(err) = player.last_error() {
        warn!("Playback ended with error: {err}");
    }

    let report = RunReport {
        clip: input.display().to_string(),
        ticks: pacer.ticks(),
        frames_shown,
        final_position: player.current_time(),
        finished,
        stats: player.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn probe(input: &Path) -> Result<()> {
    let backend = SyntheticBackend::new();
    let player = Player::open(&backend, input, EngineConfig::default())
        .with_context(|| format!("opening {}", input.display()))?;
    let streams: Vec<StreamDescriptor> = player.streams().to_vec();
    println!("{}", serde_json::to_string_pretty(&streams)?);
    Ok(())
}

fn write_sample(output: &Path, audio: bool, frames: u32) -> Result<()> {
    let mut clip = SyntheticClip {
        video: SyntheticStream {
            keyframe_interval: 24,
            pts_offset: 80,
            chunks_per_frame: 2,
            pixel_format: PixelFormat::Nv12,
            ..SyntheticStream::video(frames, 40)
        },
        ..SyntheticClip::default()
    };
    if audio {
        let blocks = (frames as u64 * 40 / 20) as u32;
        clip.audio = Some(SyntheticStream::audio(blocks, DEVICE_RATE, DEVICE_CHANNELS, 960));
        clip.audio_lead_secs = 0.1;
    }
    let json = serde_json::to_string_pretty(&clip)?;
    std::fs::write(output, json).with_context(|| format!("writing {}", output.display()))?;
    info!("Wrote sample clip to {}", output.display());
    Ok(())
}
