//! # Stream Unit - One Elementary Stream's Decode Pipeline
//!
//! A unit bundles everything one stream needs: its chunk queue, its frame
//! queues, the handshake events the demux driver waits on, the lock-step
//! result channel and the decoder itself. The decoder lives in the unit
//! between runs; a running worker takes it and puts it back on exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::budget::ChunkBudget;
use crate::chunk::{Chunk, ChunkKind};
use crate::config::EngineConfig;
use crate::decode::{Decoded, DecodedFrame, Decoder, FramePayload};
use crate::demuxer::{Packet, StreamDescriptor, StreamId, StreamKind};
use crate::frame_queue::{Frame, FrameQueues, PushOutcome, QueueListener, QueueSlot, QueueStats};
use crate::player::{ErrorSlot, PlayerError};
use crate::signal::{Cancelled, DecodeResult, Event, ExitFlag, ResultChannel};
use crate::chunk_queue::ChunkQueue;
use crate::sync::Pts;

pub struct StreamUnit {
    descriptor: StreamDescriptor,
    chunks: ChunkQueue,
    frames: FrameQueues,
    seek_started: Event,
    end_of_stream: Event,
    results: ResultChannel,
    decoder: Mutex<Option<Box<dyn Decoder>>>,
    finished: AtomicBool,
    errors: Arc<ErrorSlot>,
}

impl StreamUnit {
    pub(crate) fn new(
        descriptor: StreamDescriptor,
        decoder: Box<dyn Decoder>,
        budget: Arc<ChunkBudget>,
        config: &EngineConfig,
        listener: Option<Arc<dyn QueueListener>>,
        errors: Arc<ErrorSlot>,
    ) -> Self {
        Self {
            descriptor,
            chunks: ChunkQueue::new(budget),
            frames: FrameQueues::new(config.frame_queue_capacity, config.scratch_queue_capacity, listener),
            seek_started: Event::new(),
            end_of_stream: Event::new(),
            results: ResultChannel::new(),
            decoder: Mutex::new(Some(decoder)),
            finished: AtomicBool::new(false),
            errors,
        }
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn stream_id(&self) -> StreamId {
        self.descriptor.id
    }

    pub fn kind(&self) -> StreamKind {
        self.descriptor.kind
    }

    // ========================================================================
    // Worker lifecycle
    // ========================================================================

    /// Spawn the decode worker. The unit's queues must already be clear.
    pub(crate) fn spawn_worker(self: &Arc<Self>, exit: Arc<ExitFlag>) -> Result<JoinHandle<()>, PlayerError> {
        let decoder = self
            .decoder
            .lock()
            .take()
            .ok_or(PlayerError::Unavailable("decoder"))?;
        self.finished.store(false, Ordering::SeqCst);
        self.results.reset();

        let unit = Arc::clone(self);
        let name = format!("cadence-decode-{}", kind_label(self.kind()));
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut worker = DecodeWorker::new(Arc::clone(&unit), decoder, exit);
                worker.run();
                unit.decoder.lock().replace(worker.decoder);
            })
            .map_err(|source| PlayerError::Spawn { name, source })
    }

    /// Worker has exited for good (source exhausted or fatal error) and every
    /// queued frame has been consumed.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst) && self.frames.is_empty()
    }

    /// Drop queued chunks and frames.
    pub(crate) fn clear(&self) {
        self.chunks.clear();
        self.frames.clear();
        self.results.clear();
        self.seek_started.reset();
        self.end_of_stream.reset();
    }

    /// Wake every blocking wait on this unit so exit flags are observed.
    pub(crate) fn wake_all(&self) {
        self.chunks.wake_all();
        self.frames.wake_all();
        self.seek_started.wake();
        self.end_of_stream.wake();
    }

    // ========================================================================
    // Demux driver side
    // ========================================================================

    pub(crate) fn add_chunk(&self, packet: Packet, exit: &ExitFlag) -> bool {
        self.chunks.push_reserved(Chunk::data(packet), exit)
    }

    /// Clear pending input, release a blocked frame push or result send and
    /// queue the seek-start marker.
    pub(crate) fn begin_seek(&self, generation: u64, lockstep: bool) {
        self.chunks.clear();
        self.frames.begin_flush();
        self.results.advance(generation);
        self.seek_started.reset();
        self.chunks.push(Chunk::control(
            self.stream_id(),
            ChunkKind::SeekStart { generation, lockstep },
        ));
    }

    pub(crate) fn wait_seek_started(&self, exit: &ExitFlag) -> Result<(), Cancelled> {
        self.seek_started.wait(exit)
    }

    pub(crate) fn end_seek(&self, target: f64, landing: Vec<Frame>) {
        self.chunks
            .push(Chunk::control(self.stream_id(), ChunkKind::SeekEnd { target, landing }));
    }

    pub(crate) fn add_end_of_stream(&self) {
        self.end_of_stream.reset();
        self.chunks.push(Chunk::control(self.stream_id(), ChunkKind::EndOfStream));
    }

    pub(crate) fn wait_end_of_stream(&self, exit: &ExitFlag) -> Result<(), Cancelled> {
        self.end_of_stream.wait(exit)
    }

    pub(crate) fn add_source_exhausted(&self) {
        self.chunks
            .push(Chunk::control(self.stream_id(), ChunkKind::SourceExhausted));
    }

    pub(crate) fn wait_decode_result(&self, generation: u64, exit: &ExitFlag) -> Result<DecodeResult, Cancelled> {
        self.results.recv(generation, exit)
    }

    pub(crate) fn pop_scratch(&self) -> Option<Frame> {
        self.frames.pop_scratch()
    }

    pub(crate) fn wait_frames_drained(&self, exit: &ExitFlag) -> bool {
        self.frames.wait_drained(exit)
    }

    pub(crate) fn interrupt_drain_wait(&self) {
        self.frames.interrupt_drain_wait();
    }

    pub(crate) fn reset_drain_wait(&self) {
        self.frames.reset_drain_wait();
    }

    // ========================================================================
    // Consumer side
    // ========================================================================

    pub fn try_pop_ready(&self, clock: Pts) -> Option<Frame> {
        self.frames.try_pop_ready(clock)
    }

    pub fn pop_frame(&self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn peek_front(&self) -> Option<Pts> {
        self.frames.peek_front()
    }

    pub fn frame_stats(&self) -> QueueStats {
        self.frames.stats()
    }

    pub fn queued_chunks(&self) -> usize {
        self.chunks.len()
    }
}

pub(crate) fn kind_label(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Video => "video",
        StreamKind::Audio => "audio",
        StreamKind::Other => "other",
    }
}

// ============================================================================
// Decode worker
// ============================================================================

enum Flow {
    Continue,
    Exit,
}

struct DecodeWorker {
    unit: Arc<StreamUnit>,
    decoder: Box<dyn Decoder>,
    exit: Arc<ExitFlag>,
    generation: u64,
    lockstep: bool,
    end_of_stream_acked: bool,
    last_pts: Pts,
    last_duration: f64,
    nominal_duration: Option<f64>,
    /// DTS of the first chunk submitted since the last produced frame
    pending_first_dts: Option<i64>,
    last_dts: i64,
}

impl DecodeWorker {
    fn new(unit: Arc<StreamUnit>, decoder: Box<dyn Decoder>, exit: Arc<ExitFlag>) -> Self {
        let nominal_duration = unit.descriptor.nominal_frame_duration();
        let last_dts = unit.descriptor.start_ts();
        Self {
            unit,
            decoder,
            exit,
            generation: 0,
            lockstep: false,
            end_of_stream_acked: false,
            last_pts: Pts::Unset,
            last_duration: 0.0,
            nominal_duration,
            pending_first_dts: None,
            last_dts,
        }
    }

    fn label(&self) -> &'static str {
        kind_label(self.unit.kind())
    }

    fn run(&mut self) {
        debug!(target: "cadence::decode", stream = self.label(), decoder = self.decoder.name(), "decode worker started");
        loop {
            if self.exit.is_requested() {
                break;
            }
            let step = match self.decoder.receive() {
                Ok(Decoded::Frame(decoded)) => self.deliver(decoded),
                Ok(Decoded::NeedMoreInput) => self.report(DecodeResult::NeedMoreInput).and_then(|_| self.feed()),
                Ok(Decoded::EndOfStream) => {
                    if !self.end_of_stream_acked {
                        self.end_of_stream_acked = true;
                        self.unit.end_of_stream.set();
                    }
                    self.report(DecodeResult::EndOfStream).and_then(|_| self.feed())
                }
                Err(err) if err.is_fatal() => Ok(self.fail(err)),
                Err(err) => {
                    warn!(target: "cadence::decode", stream = self.label(), %err, "decoder receive failed, continuing");
                    self.report(DecodeResult::NeedMoreInput).and_then(|_| self.feed())
                }
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) | Err(Cancelled) => break,
            }
        }
        debug!(target: "cadence::decode", stream = self.label(), "decode worker stopped");
    }

    /// Report a step result when the demux driver is listening.
    fn report(&self, result: DecodeResult) -> Result<(), Cancelled> {
        if !self.lockstep {
            return Ok(());
        }
        self.unit.results.send(self.generation, result, &self.exit)
    }

    fn fail(&mut self, err: crate::decode::DecodeError) -> Flow {
        error!(target: "cadence::decode", stream = self.label(), %err, "decoder failed");
        self.unit.errors.record(PlayerError::Decode {
            stream: self.unit.kind(),
            source: err,
        });
        self.unit.finished.store(true, Ordering::SeqCst);
        let _ = self.report(DecodeResult::Fatal);
        Flow::Exit
    }

    /// Pop the next chunk and act on it.
    fn feed(&mut self) -> Result<Flow, Cancelled> {
        let chunk = self.unit.chunks.pop(&self.exit).ok_or(Cancelled)?;
        match chunk.kind {
            ChunkKind::Data(packet) => {
                self.pending_first_dts.get_or_insert(packet.dts);
                self.last_dts = packet.dts;
                if let Err(err) = self.decoder.submit(&packet) {
                    if err.is_fatal() {
                        return Ok(self.fail(err));
                    }
                    trace!(target: "cadence::decode", stream = self.label(), dts = packet.dts, %err, "chunk dropped");
                }
            }
            ChunkKind::SeekStart { generation, lockstep } => {
                self.decoder.flush();
                self.unit.frames.start_scratch();
                self.generation = generation;
                self.lockstep = lockstep;
                self.end_of_stream_acked = false;
                self.last_pts = Pts::Unset;
                self.pending_first_dts = None;
                trace!(target: "cadence::decode", stream = self.label(), generation, lockstep, "seek started");
                self.unit.seek_started.set();
            }
            ChunkKind::SeekEnd { target, landing } => {
                trace!(target: "cadence::decode", stream = self.label(), target, landing = landing.len(), "seek finished");
                self.unit.frames.finish_scratch(landing);
                self.last_pts = Pts::Secs(target);
                self.lockstep = false;
            }
            ChunkKind::EndOfStream => {
                self.end_of_stream_acked = false;
                if let Err(err) = self.decoder.submit_end_of_stream() {
                    if err.is_fatal() {
                        return Ok(self.fail(err));
                    }
                    warn!(target: "cadence::decode", stream = self.label(), %err, "end of stream rejected");
                }
            }
            ChunkKind::SourceExhausted => {
                self.unit.finished.store(true, Ordering::SeqCst);
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    /// Timestamp, queue and report a decoded frame.
    fn deliver(&mut self, decoded: DecodedFrame) -> Result<Flow, Cancelled> {
        let searching = self.unit.frames.active() == QueueSlot::Scratch;
        let pts = match decoded.pts {
            Some(ts) => Pts::Secs(self.unit.descriptor.ts_to_secs(ts)),
            None => match self.last_pts {
                Pts::Secs(last) => Pts::Secs(last + self.nominal_duration.unwrap_or(self.last_duration)),
                _ if searching => Pts::Unset,
                _ => Pts::Secs(0.0),
            },
        };
        let duration = match &decoded.payload {
            FramePayload::Audio(block) => block.duration_secs(),
            FramePayload::Picture(_) => self.nominal_duration.unwrap_or(0.0),
        };
        let frame = Frame {
            pts,
            first_chunk_dts: self.pending_first_dts.take().unwrap_or(self.last_dts),
            duration,
            payload: decoded.payload,
        };
        if pts.is_set() {
            self.last_pts = pts;
        }
        self.last_duration = duration;

        match self.unit.frames.push(frame, &self.exit) {
            PushOutcome::Cancelled => return Err(Cancelled),
            PushOutcome::Queued | PushOutcome::Discarded => {}
        }
        self.report(DecodeResult::FrameReady)?;
        Ok(Flow::Continue)
    }
}
