//! Container capability: the opaque demuxer the engine reads chunks from.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::Decoder;

pub type StreamId = usize;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("Media not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Unsupported container: {0}")]
    Unsupported(String),
    #[error("Failed to parse container: {0}")]
    Parse(String),
    #[error("No video stream found")]
    NoVideoStream,
    #[error("No decoder for stream {stream}: {reason}")]
    Decoder { stream: StreamId, reason: String },
    #[error("Open error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Read error: {0}")]
    Read(String),
    #[error("Cannot seek stream {stream} to {target}: {reason}")]
    Seek {
        stream: StreamId,
        target: i64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// Rational number, used for time bases and frame rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> Option<f64> {
        if self.num == 0 || self.den == 0 {
            return None;
        }
        Some(self.num as f64 / self.den as f64)
    }
}

/// Per-stream description reported by the container on open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub kind: StreamKind,
    /// Seconds per timestamp unit
    pub time_base: Rational,
    /// First timestamp of the stream, in time-base units
    pub start_time: Option<i64>,
    /// Declared frame rate (video)
    pub frame_rate: Option<Rational>,
    /// Duration in time-base units
    pub duration: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamDescriptor {
    pub fn start_ts(&self) -> i64 {
        self.start_time.unwrap_or(0)
    }

    /// Stream timestamp to seconds, relative to the stream start so every
    /// stream shares a zero origin.
    pub fn ts_to_secs(&self, ts: i64) -> f64 {
        (ts - self.start_ts()) as f64 * self.time_base.num as f64 / self.time_base.den as f64
    }

    /// Seconds (zero origin) to the nearest stream timestamp
    pub fn secs_to_ts(&self, secs: f64) -> i64 {
        let Some(base) = self.time_base.as_f64() else {
            return self.start_ts();
        };
        (secs / base).round() as i64 + self.start_ts()
    }

    /// Duration of one frame derived from the declared frame rate
    pub fn nominal_frame_duration(&self) -> Option<f64> {
        let rate = self.frame_rate?.as_f64()?;
        if rate <= 0.0 {
            return None;
        }
        Some(1.0 / rate)
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let duration = self.duration?;
        Some(duration as f64 * self.time_base.as_f64()?)
    }
}

/// A compressed access unit as read from the container
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream: StreamId,
    /// Decode timestamp, time-base units
    pub dts: i64,
    /// Presentation timestamp, when the container carries one
    pub pts: Option<i64>,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    /// Land on the closest keyframe at or before the target
    Backward,
    /// Land on the closest keyframe at or after the target
    Forward,
}

/// An open container. Read and seek are only ever called from the demux
/// thread.
pub trait Container: Send {
    /// Next chunk in container order, `Ok(None)` at end of file.
    fn read_next_chunk(&mut self) -> Result<Option<Packet>, SourceError>;

    /// Move the read cursor to a keyframe of `stream` near `target`
    /// (time-base units of that stream).
    fn seek(&mut self, stream: StreamId, target: i64, direction: SeekDirection) -> Result<(), SourceError>;

    /// Open a decoder for one of this container's streams.
    fn create_decoder(&self, stream: &StreamDescriptor) -> Result<Box<dyn Decoder>, OpenError>;
}

pub struct OpenedMedia {
    pub container: Box<dyn Container>,
    pub streams: Vec<StreamDescriptor>,
}

/// Entry point of a demux/decode backend
pub trait MediaBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<OpenedMedia, OpenError>;

    fn name(&self) -> &str;
}
