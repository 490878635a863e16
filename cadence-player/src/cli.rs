use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Headless driver for the Cadence decode engine")]
pub struct Cli {
    /// Path to an engine config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Play a clip against a virtual display and audio device
    Play {
        /// Clip description to play
        #[arg(required = true)]
        input: PathBuf,

        /// Start position in seconds
        #[arg(long, default_value = "0")]
        start: f64,

        /// Seek to this position once playback is running
        #[arg(long)]
        seek: Option<f64>,

        /// Stop after this many seconds of wall-clock time
        #[arg(long, default_value = "10")]
        duration: f64,

        /// Display refresh rate driving `tick`
        #[arg(long, default_value = "60")]
        refresh: f64,

        /// Restart from the beginning at end of stream
        #[arg(long = "loop")]
        looping: bool,

        /// Skip the audio stream
        #[arg(long)]
        no_audio: bool,

        /// Playback speed for video-only clips
        #[arg(long)]
        speed: Option<f64>,
    },

    /// Print stream information for a clip
    Probe {
        #[arg(required = true)]
        input: PathBuf,
    },

    /// Write a sample clip description
    Sample {
        #[arg(required = true)]
        output: PathBuf,

        /// Include an audio stream
        #[arg(long)]
        audio: bool,

        /// Number of video frames
        #[arg(long, default_value = "240")]
        frames: u32,
    },

    /// Write the default engine config
    InitConfig {
        #[arg(required = true)]
        output: PathBuf,
    },
}
