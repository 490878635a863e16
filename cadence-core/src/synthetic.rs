//! # Synthetic Media Backend
//!
//! A deterministic container and decoder pair generated from a small clip
//! description. It exercises the engine without a real codec: GOP structure,
//! multi-chunk frames, decoder delay, interleaving skew between audio and
//! video, missing timestamps and injected failures are all configurable.
//!
//! Clips can be registered in memory or loaded from a `.json` description.
//! Every read, seek and decoder submit is logged to a [`SyntheticProbe`].

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::decode::{
    AudioBlock, DecodeError, Decoded, DecodedFrame, Decoder, FramePayload, Picture, PixelFormat,
};
use crate::demuxer::{
    Container, MediaBackend, OpenError, OpenedMedia, Packet, Rational, SeekDirection, SourceError,
    StreamDescriptor, StreamId, StreamKind,
};

pub const VIDEO_STREAM: StreamId = 0;
pub const AUDIO_STREAM: StreamId = 1;

const HEADER_BYTES: usize = 12;

// ============================================================================
// Clip description
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticStream {
    pub frame_count: u32,
    pub time_base: Rational,
    pub start_time: i64,
    /// Frame (or audio block) duration in time-base units
    pub frame_duration: i64,
    /// Every n-th frame is a keyframe
    pub keyframe_interval: u32,
    /// Added to the DTS to form the PTS
    pub pts_offset: i64,
    pub chunks_per_frame: u32,
    pub chunk_bytes: usize,
    /// Frames the decoder holds before releasing output
    pub decoder_delay: usize,
    /// Decoder output carries no timestamps
    pub omit_timestamps: bool,
    /// Container seeks on this stream fail
    pub fail_seek: bool,
    /// Decoder fails fatally when completing this frame
    pub fail_decode_at: Option<u32>,
    /// Layout of decoded pictures
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for SyntheticStream {
    fn default() -> Self {
        Self::video(10, 100)
    }
}

impl SyntheticStream {
    /// Video in a 1/1000 time base, every frame a keyframe
    pub fn video(frame_count: u32, frame_duration_ms: i64) -> Self {
        Self {
            frame_count,
            time_base: Rational::new(1, 1_000),
            start_time: 0,
            frame_duration: frame_duration_ms,
            keyframe_interval: 1,
            pts_offset: 0,
            chunks_per_frame: 1,
            chunk_bytes: 256,
            decoder_delay: 0,
            omit_timestamps: false,
            fail_seek: false,
            fail_decode_at: None,
            pixel_format: PixelFormat::I420,
            width: 16,
            height: 16,
            sample_rate: 0,
            channels: 0,
        }
    }

    /// Audio in a 1/sample_rate time base
    pub fn audio(block_count: u32, sample_rate: u32, channels: u16, block_frames: i64) -> Self {
        Self {
            frame_count: block_count,
            time_base: Rational::new(1, sample_rate as i64),
            frame_duration: block_frames,
            chunk_bytes: 64,
            width: 0,
            height: 0,
            sample_rate,
            channels,
            ..Self::video(block_count, block_frames)
        }
    }

    fn descriptor(&self, id: StreamId, kind: StreamKind) -> StreamDescriptor {
        let frame_rate = match kind {
            StreamKind::Video => Some(Rational::new(self.time_base.den, self.time_base.num * self.frame_duration)),
            _ => None,
        };
        StreamDescriptor {
            id,
            kind,
            time_base: self.time_base,
            start_time: Some(self.start_time),
            frame_rate,
            duration: Some(self.frame_count as i64 * self.frame_duration),
            width: self.width,
            height: self.height,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    fn secs(&self, ts: i64) -> f64 {
        ts as f64 * self.time_base.as_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticClip {
    pub video: SyntheticStream,
    pub audio: Option<SyntheticStream>,
    /// Audio chunks are stored this many seconds ahead of the video chunks
    /// with the same timestamp
    pub audio_lead_secs: f64,
}

impl Default for SyntheticClip {
    fn default() -> Self {
        Self {
            video: SyntheticStream::default(),
            audio: None,
            audio_lead_secs: 0.0,
        }
    }
}

impl SyntheticClip {
    pub fn load(path: &Path) -> Result<Self, OpenError> {
        let content = std::fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => OpenError::NotFound(path.to_path_buf()),
            _ => OpenError::Io(err),
        })?;
        serde_json::from_str(&content).map_err(|err| OpenError::Parse(err.to_string()))
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        let mut streams = vec![self.video.descriptor(VIDEO_STREAM, StreamKind::Video)];
        if let Some(audio) = &self.audio {
            streams.push(audio.descriptor(AUDIO_STREAM, StreamKind::Audio));
        }
        streams
    }

    fn stream(&self, id: StreamId) -> Option<&SyntheticStream> {
        match id {
            VIDEO_STREAM => Some(&self.video),
            AUDIO_STREAM => self.audio.as_ref(),
            _ => None,
        }
    }

    /// All chunks in container order
    fn packets(&self) -> Vec<Packet> {
        let mut ordered: Vec<(f64, Packet)> = Vec::new();
        let mut layout = |id: StreamId, stream: &SyntheticStream, lead: f64| {
            for index in 0..stream.frame_count {
                let dts = stream.start_time + index as i64 * stream.frame_duration;
                let keyframe = index % stream.keyframe_interval.max(1) == 0;
                let parts = stream.chunks_per_frame.max(1);
                for part in 0..parts {
                    let mut data = Vec::with_capacity(stream.chunk_bytes.max(HEADER_BYTES));
                    data.extend_from_slice(&index.to_le_bytes());
                    data.extend_from_slice(&part.to_le_bytes());
                    data.extend_from_slice(&parts.to_le_bytes());
                    data.resize(stream.chunk_bytes.max(HEADER_BYTES), (index % 251) as u8);
                    ordered.push((
                        stream.secs(dts) - lead,
                        Packet {
                            stream: id,
                            dts,
                            pts: Some(dts + stream.pts_offset),
                            keyframe: keyframe && part == 0,
                            data,
                        },
                    ));
                }
            }
        };
        layout(VIDEO_STREAM, &self.video, 0.0);
        if let Some(audio) = &self.audio {
            layout(AUDIO_STREAM, audio, self.audio_lead_secs);
        }
        ordered.sort_by(|a, b| a.0.total_cmp(&b.0));
        ordered.into_iter().map(|(_, packet)| packet).collect()
    }
}

// ============================================================================
// Probe
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    Read { stream: StreamId, dts: i64 },
    Seek { stream: StreamId, target: i64 },
    Submit { stream: StreamId, dts: i64 },
}

/// Shared log of container and decoder activity
#[derive(Debug, Default)]
pub struct SyntheticProbe {
    events: Mutex<Vec<ProbeEvent>>,
}

impl SyntheticProbe {
    fn record(&self, event: ProbeEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<ProbeEvent> {
        self.events.lock().clone()
    }

    pub fn seeks(&self) -> Vec<(StreamId, i64)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match *event {
                ProbeEvent::Seek { stream, target } => Some((stream, target)),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, ProbeEvent::Read { .. }))
            .count()
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
pub struct SyntheticBackend {
    clips: Mutex<HashMap<PathBuf, SyntheticClip>>,
    probe: Arc<SyntheticProbe>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clip(path: impl Into<PathBuf>, clip: SyntheticClip) -> Self {
        let backend = Self::new();
        backend.register(path, clip);
        backend
    }

    pub fn register(&self, path: impl Into<PathBuf>, clip: SyntheticClip) {
        self.clips.lock().insert(path.into(), clip);
    }

    pub fn probe(&self) -> Arc<SyntheticProbe> {
        Arc::clone(&self.probe)
    }
}

impl MediaBackend for SyntheticBackend {
    fn open(&self, path: &Path) -> Result<OpenedMedia, OpenError> {
        let registered = self.clips.lock().get(path).cloned();
        let clip = match registered {
            Some(clip) => clip,
            None => match path.extension().and_then(|ext| ext.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("json") => SyntheticClip::load(path)?,
                Some(ext) => return Err(OpenError::Unsupported(ext.to_string())),
                None => return Err(OpenError::NotFound(path.to_path_buf())),
            },
        };
        let streams = clip.descriptors();
        let container = SyntheticContainer {
            packets: clip.packets(),
            clip: Arc::new(clip),
            cursor: 0,
            probe: Arc::clone(&self.probe),
        };
        Ok(OpenedMedia {
            container: Box::new(container),
            streams,
        })
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

// ============================================================================
// Container
// ============================================================================

pub struct SyntheticContainer {
    clip: Arc<SyntheticClip>,
    packets: Vec<Packet>,
    cursor: usize,
    probe: Arc<SyntheticProbe>,
}

impl Container for SyntheticContainer {
    fn read_next_chunk(&mut self) -> Result<Option<Packet>, SourceError> {
        let Some(packet) = self.packets.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;
        self.probe.record(ProbeEvent::Read {
            stream: packet.stream,
            dts: packet.dts,
        });
        Ok(Some(packet))
    }

    fn seek(&mut self, stream: StreamId, target: i64, direction: SeekDirection) -> Result<(), SourceError> {
        self.probe.record(ProbeEvent::Seek { stream, target });
        let fail = |reason: &str| SourceError::Seek {
            stream,
            target,
            reason: reason.to_string(),
        };
        let layout = self.clip.stream(stream).ok_or_else(|| fail("unknown stream"))?;
        if layout.fail_seek {
            return Err(fail("seek index unavailable"));
        }

        let keyframes = self
            .packets
            .iter()
            .enumerate()
            .filter(|(_, packet)| packet.stream == stream && packet.keyframe);
        let chosen = match direction {
            SeekDirection::Backward => keyframes
                .clone()
                .filter(|(_, packet)| packet.dts <= target)
                .max_by_key(|(_, packet)| packet.dts)
                .or_else(|| keyframes.min_by_key(|(_, packet)| packet.dts)),
            SeekDirection::Forward => keyframes
                .clone()
                .filter(|(_, packet)| packet.dts >= target)
                .min_by_key(|(_, packet)| packet.dts)
                .or_else(|| keyframes.max_by_key(|(_, packet)| packet.dts)),
        };
        let (index, _) = chosen.ok_or_else(|| fail("no keyframes"))?;
        self.cursor = index;
        Ok(())
    }

    fn create_decoder(&self, stream: &StreamDescriptor) -> Result<Box<dyn Decoder>, OpenError> {
        let layout = self.clip.stream(stream.id).ok_or_else(|| OpenError::Decoder {
            stream: stream.id,
            reason: "no synthetic stream".into(),
        })?;
        Ok(Box::new(SyntheticDecoder::new(
            stream.id,
            stream.kind,
            layout.clone(),
            Arc::clone(&self.probe),
        )))
    }
}

// ============================================================================
// Decoder
// ============================================================================

pub struct SyntheticDecoder {
    stream: StreamId,
    kind: StreamKind,
    layout: SyntheticStream,
    probe: Arc<SyntheticProbe>,
    needs_keyframe: bool,
    /// (frame index, next expected part) of a frame split over chunks
    assembling: Option<(u32, u32)>,
    held: VecDeque<DecodedFrame>,
    ready: VecDeque<DecodedFrame>,
    end_of_stream: bool,
}

impl SyntheticDecoder {
    fn new(stream: StreamId, kind: StreamKind, layout: SyntheticStream, probe: Arc<SyntheticProbe>) -> Self {
        Self {
            stream,
            kind,
            layout,
            probe,
            needs_keyframe: true,
            assembling: None,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            end_of_stream: false,
        }
    }

    fn payload(&self, index: u32) -> FramePayload {
        match self.kind {
            StreamKind::Audio => FramePayload::Audio(AudioBlock {
                sample_rate: self.layout.sample_rate,
                channels: self.layout.channels,
                samples: vec![0.25; self.layout.frame_duration.max(0) as usize * self.layout.channels as usize],
            }),
            _ => FramePayload::Picture(Picture {
                width: self.layout.width,
                height: self.layout.height,
                format: self.layout.pixel_format,
                data: vec![(index % 256) as u8; self.layout.pixel_format.buffer_size(self.layout.width, self.layout.height)],
            }),
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

impl Decoder for SyntheticDecoder {
    fn submit(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        self.probe.record(ProbeEvent::Submit {
            stream: self.stream,
            dts: packet.dts,
        });
        let (Some(index), Some(part), Some(parts)) =
            (read_u32(&packet.data, 0), read_u32(&packet.data, 4), read_u32(&packet.data, 8))
        else {
            return Err(DecodeError::Rejected("truncated chunk".into()));
        };

        if self.needs_keyframe {
            if !packet.keyframe {
                return Err(DecodeError::Rejected(format!("frame {index} has no reference")));
            }
            self.needs_keyframe = false;
        }
        let expected = match self.assembling {
            Some((frame, next)) if frame == index => next,
            _ => 0,
        };
        if part != expected {
            self.assembling = None;
            return Err(DecodeError::Rejected(format!("frame {index} part {part} out of order")));
        }
        if part + 1 < parts {
            self.assembling = Some((index, part + 1));
            return Ok(());
        }
        self.assembling = None;

        if self.layout.fail_decode_at == Some(index) {
            return Err(DecodeError::Fatal(format!("injected failure at frame {index}")));
        }
        let frame = DecodedFrame {
            pts: if self.layout.omit_timestamps { None } else { packet.pts },
            payload: self.payload(index),
        };
        self.held.push_back(frame);
        while self.held.len() > self.layout.decoder_delay {
            self.ready.extend(self.held.pop_front());
        }
        Ok(())
    }

    fn submit_end_of_stream(&mut self) -> Result<(), DecodeError> {
        self.end_of_stream = true;
        self.ready.extend(self.held.drain(..));
        Ok(())
    }

    fn receive(&mut self) -> Result<Decoded, DecodeError> {
        if let Some(frame) = self.ready.pop_front() {
            return Ok(Decoded::Frame(frame));
        }
        if self.end_of_stream {
            return Ok(Decoded::EndOfStream);
        }
        Ok(Decoded::NeedMoreInput)
    }

    fn flush(&mut self) {
        self.needs_keyframe = true;
        self.assembling = None;
        self.held.clear();
        self.ready.clear();
        self.end_of_stream = false;
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(clip: SyntheticClip) -> (OpenedMedia, Arc<SyntheticProbe>) {
        let backend = SyntheticBackend::with_clip("clip", clip);
        let media = backend.open(Path::new("clip")).unwrap();
        (media, backend.probe())
    }

    fn drain(container: &mut dyn Container) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = container.read_next_chunk().unwrap() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_descriptors() {
        let clip = SyntheticClip {
            audio: Some(SyntheticStream::audio(10, 48_000, 2, 4_800)),
            ..SyntheticClip::default()
        };
        let streams = clip.descriptors();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].kind, StreamKind::Video);
        assert!((streams[0].nominal_frame_duration().unwrap() - 0.1).abs() < 1e-12);
        assert!((streams[1].duration_secs().unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_audio_lead_interleaving() {
        let clip = SyntheticClip {
            video: SyntheticStream::video(4, 100),
            audio: Some(SyntheticStream::audio(4, 1_000, 1, 100)),
            audio_lead_secs: 0.2,
        };
        let (mut media, _) = open(clip);
        let order: Vec<(StreamId, i64)> = drain(media.container.as_mut())
            .iter()
            .map(|packet| (packet.stream, packet.dts))
            .collect();
        // audio block at 0.2s sits next to video frame 0.0s
        let audio_pos = order.iter().position(|&entry| entry == (AUDIO_STREAM, 200)).unwrap();
        let video_pos = order.iter().position(|&entry| entry == (VIDEO_STREAM, 0)).unwrap();
        assert!(audio_pos.abs_diff(video_pos) <= 1);
    }

    #[test]
    fn test_backward_seek_lands_on_keyframe() {
        let clip = SyntheticClip {
            video: SyntheticStream {
                keyframe_interval: 5,
                ..SyntheticStream::video(10, 100)
            },
            ..SyntheticClip::default()
        };
        let (mut media, probe) = open(clip);
        media.container.seek(VIDEO_STREAM, 700, SeekDirection::Backward).unwrap();
        assert_eq!(media.container.read_next_chunk().unwrap().unwrap().dts, 500);

        media.container.seek(VIDEO_STREAM, 499, SeekDirection::Backward).unwrap();
        assert_eq!(media.container.read_next_chunk().unwrap().unwrap().dts, 0);

        media.container.seek(VIDEO_STREAM, 600, SeekDirection::Forward).unwrap();
        assert_eq!(media.container.read_next_chunk().unwrap().unwrap().dts, 500);
        assert_eq!(probe.seeks(), vec![(VIDEO_STREAM, 700), (VIDEO_STREAM, 499), (VIDEO_STREAM, 600)]);
    }

    #[test]
    fn test_injected_seek_failure() {
        let clip = SyntheticClip {
            video: SyntheticStream {
                fail_seek: true,
                ..SyntheticStream::default()
            },
            ..SyntheticClip::default()
        };
        let (mut media, _) = open(clip);
        assert!(matches!(
            media.container.seek(VIDEO_STREAM, 0, SeekDirection::Backward),
            Err(SourceError::Seek { .. })
        ));
    }

    #[test]
    fn test_decoder_assembles_and_delays() {
        let clip = SyntheticClip {
            video: SyntheticStream {
                chunks_per_frame: 2,
                decoder_delay: 1,
                ..SyntheticStream::video(3, 100)
            },
            ..SyntheticClip::default()
        };
        let (mut media, _) = open(clip);
        let descriptor = media.streams[0].clone();
        let mut decoder = media.container.create_decoder(&descriptor).unwrap();
        let packets = drain(media.container.as_mut());
        assert_eq!(packets.len(), 6);

        decoder.submit(&packets[0]).unwrap();
        decoder.submit(&packets[1]).unwrap();
        assert!(matches!(decoder.receive().unwrap(), Decoded::NeedMoreInput));
        decoder.submit(&packets[2]).unwrap();
        decoder.submit(&packets[3]).unwrap();
        match decoder.receive().unwrap() {
            Decoded::Frame(frame) => assert_eq!(frame.pts, Some(0)),
            other => panic!("expected frame, got {other:?}"),
        }
        decoder.submit_end_of_stream().unwrap();
        assert!(matches!(decoder.receive().unwrap(), Decoded::Frame(_)));
        assert!(matches!(decoder.receive().unwrap(), Decoded::EndOfStream));
    }

    #[test]
    fn test_decoder_honors_pixel_format() {
        for format in [PixelFormat::Nv12, PixelFormat::P010, PixelFormat::Rgba8] {
            let clip = SyntheticClip {
                video: SyntheticStream {
                    pixel_format: format,
                    ..SyntheticStream::video(1, 100)
                },
                ..SyntheticClip::default()
            };
            let (mut media, _) = open(clip);
            let descriptor = media.streams[0].clone();
            let mut decoder = media.container.create_decoder(&descriptor).unwrap();
            let packets = drain(media.container.as_mut());
            decoder.submit(&packets[0]).unwrap();
            match decoder.receive().unwrap() {
                Decoded::Frame(DecodedFrame {
                    payload: FramePayload::Picture(picture),
                    ..
                }) => {
                    assert_eq!(picture.format, format);
                    assert_eq!(picture.data.len(), format.buffer_size(16, 16));
                }
                other => panic!("expected picture, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_decoder_needs_keyframe_after_flush() {
        let clip = SyntheticClip {
            video: SyntheticStream {
                keyframe_interval: 5,
                ..SyntheticStream::video(10, 100)
            },
            ..SyntheticClip::default()
        };
        let (mut media, _) = open(clip);
        let descriptor = media.streams[0].clone();
        let mut decoder = media.container.create_decoder(&descriptor).unwrap();
        let packets = drain(media.container.as_mut());

        let err = decoder.submit(&packets[3]).unwrap_err();
        assert!(!err.is_fatal());
        decoder.submit(&packets[5]).unwrap();
        decoder.flush();
        assert!(decoder.submit(&packets[6]).is_err());
    }

    #[test]
    fn test_open_rejects_unknown_media() {
        let backend = SyntheticBackend::new();
        assert!(matches!(backend.open(Path::new("movie.mkv")), Err(OpenError::Unsupported(_))));
        assert!(matches!(backend.open(Path::new("/nonexistent/clip.json")), Err(OpenError::NotFound(_))));
    }

    #[test]
    fn test_open_clip_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.json");
        let clip = SyntheticClip {
            video: SyntheticStream::video(3, 40),
            ..SyntheticClip::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&clip).unwrap()).unwrap();

        let media = SyntheticBackend::new().open(&path).unwrap();
        assert_eq!(media.streams.len(), 1);
        assert_eq!(media.streams[0].duration, Some(120));
    }
}
