//! Items flowing through a stream's chunk queue: compressed data plus the
//! in-band control markers the demux driver uses to steer a decode worker.

use crate::demuxer::{Packet, StreamId};
use crate::frame_queue::Frame;

#[derive(Debug)]
pub enum ChunkKind {
    Data(Packet),
    /// Flush the decoder and start collecting frames in the scratch queue.
    SeekStart { generation: u64, lockstep: bool },
    /// Switch back to the regular queue, seeded with the landing frames.
    SeekEnd { target: f64, landing: Vec<Frame> },
    /// Feed the decoder its end-of-stream sentinel.
    EndOfStream,
    /// Nothing more will arrive; the worker exits.
    SourceExhausted,
}

#[derive(Debug)]
pub struct Chunk {
    pub stream: StreamId,
    pub kind: ChunkKind,
}

impl Chunk {
    pub fn data(packet: Packet) -> Self {
        Self {
            stream: packet.stream,
            kind: ChunkKind::Data(packet),
        }
    }

    pub fn control(stream: StreamId, kind: ChunkKind) -> Self {
        Self { stream, kind }
    }

    /// Bytes charged against the chunk budget. Control markers are free.
    pub fn size(&self) -> u64 {
        match &self.kind {
            ChunkKind::Data(packet) => packet.size(),
            _ => 0,
        }
    }

    pub fn dts(&self) -> Option<i64> {
        match &self.kind {
            ChunkKind::Data(packet) => Some(packet.dts),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self.kind, ChunkKind::Data(_))
    }
}
