//! # Decoder Capability
//!
//! The bitstream decoder is an external collaborator. The engine only needs
//! the submit/receive contract below: one chunk may yield zero, one or many
//! frames, and one frame may need several chunks.
//!
//! Backends implement [`Decoder`]; containers hand out one decoder per
//! elementary stream (see [`crate::demuxer::Container::create_decoder`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::demuxer::Packet;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoder refused a chunk (corrupt data, missing reference frame).
    /// The decode loop drops the chunk and keeps pumping.
    #[error("Chunk rejected: {0}")]
    Rejected(String),
    /// The decoder cannot continue.
    #[error("Decoder failed: {0}")]
    Fatal(String),
}

impl DecodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Fatal(_))
    }
}

/// Pixel format of decoded pictures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12, // 4:2:0 semi-planar (Y plane + interleaved UV)
    I420, // 4:2:0 planar (Y + U + V separate)
    P010, // 10-bit 4:2:0 (for HDR)
    Rgba8,
}

impl PixelFormat {
    /// Buffer size in bytes for a picture of this format
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            Self::Nv12 | Self::I420 => w * h * 3 / 2,
            Self::P010 => w * h * 3,
            Self::Rgba8 => w * h * 4,
        }
    }
}

/// A decoded picture. Rendering is out of scope, the bytes are handed to the
/// caller of `tick` untouched.
#[derive(Debug, Clone)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// A decoded block of audio, interleaved `f32` samples.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBlock {
    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone)]
pub enum FramePayload {
    Picture(Picture),
    Audio(AudioBlock),
}

/// Output of one successful `receive` call
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Best-effort presentation timestamp in stream time-base units, if the
    /// decoder knows it.
    pub pts: Option<i64>,
    pub payload: FramePayload,
}

/// Result of asking the decoder for a frame
#[derive(Debug)]
pub enum Decoded {
    Frame(DecodedFrame),
    /// Submit another chunk before asking again.
    NeedMoreInput,
    /// All frames up to the end-of-stream sentinel have been returned.
    EndOfStream,
}

/// Decoder trait - implemented by every decoder backend
pub trait Decoder: Send {
    /// Feed one compressed chunk.
    fn submit(&mut self, packet: &Packet) -> Result<(), DecodeError>;

    /// Feed the end-of-stream sentinel; pending frames are flushed out
    /// through `receive`, followed by [`Decoded::EndOfStream`].
    fn submit_end_of_stream(&mut self) -> Result<(), DecodeError>;

    /// Ask for an already available frame.
    fn receive(&mut self) -> Result<Decoded, DecodeError>;

    /// Drop all internal state (reference frames, buffered output).
    fn flush(&mut self);

    /// Decoder name for logs
    fn name(&self) -> &str;
}
