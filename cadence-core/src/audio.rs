//! # Audio Output Conversion
//!
//! The host's audio device pulls bytes through `fill_audio_buffer`. Decoded
//! blocks are popped from the audio stream's regular frame queue, remapped to
//! the device channel count, resampled with rubato when the rates differ and
//! written in the device sample format. Underruns are padded with silence.
//!
//! Each fill also moves the audio clocks: the decode clock is the end time of
//! the newest block popped, the play clock subtracts what is still buffered
//! here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rubato::{FastFixedIn, PolynomialDegree, ResampleError, Resampler, ResamplerConstructionError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::decode::{AudioBlock, FramePayload};
use crate::stream_unit::StreamUnit;
use crate::sync::{ClockSet, Pts};

const RESAMPLER_CHUNK_FRAMES: usize = 1024;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),
    #[error("Resampler setup failed: {0}")]
    ResamplerSetup(#[from] ResamplerConstructionError),
    #[error("Resampling failed: {0}")]
    Resample(#[from] ResampleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    S64,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
            Self::S64 | Self::F64 => 8,
        }
    }
}

/// Format the host device expects, interleaved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.sample_format.bytes()
    }

    fn validate(&self) -> Result<(), AudioError> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(AudioError::InvalidFormat(format!(
                "{} Hz, {} channels",
                self.sample_rate, self.channels
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Resampling
// ============================================================================

struct StreamResampler {
    source_rate: u32,
    target_rate: u32,
    channels: usize,
    inner: FastFixedIn<f32>,
    /// Planar input waiting for a full resampler chunk
    input: Vec<Vec<f32>>,
}

impl StreamResampler {
    fn new(source_rate: u32, target_rate: u32, channels: usize) -> Result<Self, AudioError> {
        let ratio = target_rate as f64 / source_rate as f64;
        let inner = FastFixedIn::<f32>::new(ratio, 1.1, PolynomialDegree::Linear, RESAMPLER_CHUNK_FRAMES, channels)?;
        debug!(target: "cadence::audio", source_rate, target_rate, channels, "resampler created");
        Ok(Self {
            source_rate,
            target_rate,
            channels,
            inner,
            input: vec![Vec::new(); channels],
        })
    }

    fn matches(&self, source_rate: u32, target_rate: u32, channels: usize) -> bool {
        self.source_rate == source_rate && self.target_rate == target_rate && self.channels == channels
    }

    fn process(&mut self, planar: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, AudioError> {
        for (buffered, data) in self.input.iter_mut().zip(planar) {
            buffered.extend(data);
        }
        let mut output = vec![Vec::new(); self.channels];
        loop {
            let needed = self.inner.input_frames_next();
            if self.input.first().map_or(0, Vec::len) < needed {
                break;
            }
            let chunk: Vec<&[f32]> = self.input.iter().map(|channel| &channel[..needed]).collect();
            let produced = self.inner.process(&chunk, None)?;
            for (out, data) in output.iter_mut().zip(produced) {
                out.extend(data);
            }
            for channel in &mut self.input {
                channel.drain(..needed);
            }
        }
        Ok(output)
    }

    /// Input frames held back, expressed at the output rate
    fn buffered_output_frames(&self) -> f64 {
        let frames = self.input.first().map_or(0, Vec::len);
        frames as f64 * self.target_rate as f64 / self.source_rate as f64
    }
}

// ============================================================================
// Audio output
// ============================================================================

pub(crate) struct AudioOutput {
    /// Converted samples (device rate and channel count) not yet written
    pending: VecDeque<f32>,
    pending_channels: usize,
    resampler: Option<StreamResampler>,
    decode_clock: Pts,
    /// Set by the audio queue listener when the queue was cleared
    discard: Arc<AtomicBool>,
}

impl AudioOutput {
    pub(crate) fn new(discard: Arc<AtomicBool>) -> Self {
        Self {
            pending: VecDeque::new(),
            pending_channels: 0,
            resampler: None,
            decode_clock: Pts::Unset,
            discard,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.resampler = None;
        self.decode_clock = Pts::Unset;
    }

    /// Fill `buffer` completely, silence where no audio is available.
    pub(crate) fn fill(
        &mut self,
        buffer: &mut [u8],
        format: &AudioFormat,
        unit: &StreamUnit,
        clocks: &ClockSet,
    ) -> Result<(), AudioError> {
        format.validate()?;
        let channels = format.channels as usize;
        if self.discard.swap(false, Ordering::SeqCst) || self.pending_channels != channels {
            self.reset();
            self.pending_channels = channels;
        }

        let sample_bytes = format.sample_format.bytes();
        let wanted = buffer.len() / sample_bytes;
        while self.pending.len() < wanted {
            let Some(frame) = unit.pop_frame() else {
                break;
            };
            let FramePayload::Audio(block) = frame.payload else {
                continue;
            };
            self.convert(&block, format)?;
            if let Pts::Secs(start) = frame.pts {
                self.decode_clock = Pts::Secs(start + block.duration_secs());
            }
        }

        let mut samples = buffer.chunks_exact_mut(sample_bytes);
        for slot in &mut samples {
            let sample = self.pending.pop_front().unwrap_or(0.0);
            write_sample(slot, sample, format.sample_format);
        }
        let tail = samples.into_remainder();
        tail.fill(if format.sample_format == SampleFormat::U8 { 0x80 } else { 0 });

        clocks.set_audio_decode(self.decode_clock);
        if let Pts::Secs(decoded) = self.decode_clock {
            let buffered_frames = self.pending.len() as f64 / channels as f64
                + self.resampler.as_ref().map_or(0.0, StreamResampler::buffered_output_frames);
            clocks.set_audio_play(Pts::Secs(decoded - buffered_frames / format.sample_rate as f64));
        }
        Ok(())
    }

    fn convert(&mut self, block: &AudioBlock, format: &AudioFormat) -> Result<(), AudioError> {
        let channels = format.channels as usize;
        let planar = remap_channels(block, channels);
        if block.sample_rate == format.sample_rate || block.sample_rate == 0 {
            self.interleave(&planar);
            return Ok(());
        }

        let stale = self
            .resampler
            .as_ref()
            .map_or(true, |resampler| !resampler.matches(block.sample_rate, format.sample_rate, channels));
        if stale {
            self.resampler = Some(StreamResampler::new(block.sample_rate, format.sample_rate, channels)?);
        }
        if let Some(resampler) = self.resampler.as_mut() {
            let resampled = resampler.process(planar)?;
            self.interleave(&resampled);
        }
        Ok(())
    }

    fn interleave(&mut self, planar: &[Vec<f32>]) {
        let frames = planar.first().map_or(0, Vec::len);
        for index in 0..frames {
            for channel in planar {
                self.pending.push_back(channel[index]);
            }
        }
    }
}

/// Split interleaved samples into `target` planar channels.
///
/// Mono is duplicated, downmix to mono averages, other layouts reuse source
/// channels in order.
fn remap_channels(block: &AudioBlock, target: usize) -> Vec<Vec<f32>> {
    let source = block.channels as usize;
    let frames = block.frames();
    let mut planar = vec![Vec::with_capacity(frames); target];
    if source == 0 {
        return planar;
    }
    for frame in block.samples.chunks_exact(source) {
        match (source, target) {
            (1, _) => planar.iter_mut().for_each(|channel| channel.push(frame[0])),
            (_, 1) => planar[0].push(frame.iter().sum::<f32>() / source as f32),
            _ => {
                for (index, channel) in planar.iter_mut().enumerate() {
                    channel.push(frame[index % source]);
                }
            }
        }
    }
    planar
}

fn write_sample(slot: &mut [u8], sample: f32, format: SampleFormat) {
    let sample = sample.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => slot[0] = (sample * 127.0 + 128.0).round() as u8,
        SampleFormat::S16 => slot.copy_from_slice(bytemuck::bytes_of(&((sample * i16::MAX as f32) as i16))),
        SampleFormat::S32 => slot.copy_from_slice(bytemuck::bytes_of(&((sample as f64 * i32::MAX as f64) as i32))),
        SampleFormat::S64 => slot.copy_from_slice(bytemuck::bytes_of(&((sample as f64 * i64::MAX as f64) as i64))),
        SampleFormat::F32 => slot.copy_from_slice(bytemuck::bytes_of(&sample)),
        SampleFormat::F64 => slot.copy_from_slice(bytemuck::bytes_of(&(sample as f64))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(rate: u32, channels: u16, frames: usize, value: f32) -> AudioBlock {
        AudioBlock {
            sample_rate: rate,
            channels,
            samples: vec![value; frames * channels as usize],
        }
    }

    #[test]
    fn test_sample_format_sizes() {
        let format = AudioFormat::new(48_000, 2, SampleFormat::S16);
        assert_eq!(format.bytes_per_frame(), 4);
        assert_eq!(SampleFormat::F64.bytes(), 8);
        assert!(AudioFormat::new(0, 2, SampleFormat::F32).validate().is_err());
    }

    #[test]
    fn test_write_sample_formats() {
        let mut byte = [0u8; 1];
        write_sample(&mut byte, 0.0, SampleFormat::U8);
        assert_eq!(byte[0], 128);

        let mut s16 = [0u8; 2];
        write_sample(&mut s16, 1.0, SampleFormat::S16);
        assert_eq!(i16::from_ne_bytes(s16), i16::MAX);

        let mut f32_bytes = [0u8; 4];
        write_sample(&mut f32_bytes, 0.5, SampleFormat::F32);
        assert_eq!(f32::from_ne_bytes(f32_bytes), 0.5);

        let mut f64_bytes = [0u8; 8];
        write_sample(&mut f64_bytes, -2.0, SampleFormat::F64);
        assert_eq!(f64::from_ne_bytes(f64_bytes), -1.0);
    }

    #[test]
    fn test_channel_remap() {
        let mono = remap_channels(&block(48_000, 1, 4, 0.5), 2);
        assert_eq!(mono.len(), 2);
        assert_eq!(mono[1], vec![0.5; 4]);

        let stereo = AudioBlock {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![1.0, 0.0, 1.0, 0.0],
        };
        let down = remap_channels(&stereo, 1);
        assert_eq!(down[0], vec![0.5, 0.5]);
    }

    #[test]
    fn test_resampler_changes_frame_count() {
        let mut resampler = StreamResampler::new(24_000, 48_000, 1).unwrap();
        let output = resampler.process(vec![vec![0.25; 4_096]]).unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].len() > 4_096);
    }
}
