//! # Demux Driver - Container Reads and the Seek State Machine
//!
//! The demux thread owns the container. While playing it reads chunks in
//! container order and routes them to their stream units, throttled by the
//! chunk budget. Seeks run a small state machine:
//!
//! ```text
//!              seek request
//!   Playing ───────────────► SeekRequested ──► SeekingToStartFrame
//!      ▲                          ▲    (cursor tightened) │
//!      │                          └───────────────────────┤
//!      │                                                  ▼
//!      └──────────── finish ◄──────────────── SeekingToTargetFrame
//! ```
//!
//! During a seek one stream drives (audio when decoded, else video). The
//! driver and that stream's worker run in lock-step: a driving chunk is only
//! read after the worker reported it needs more input, so the container is
//! never read past the landing frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::demuxer::{Container, SeekDirection, SourceError, StreamId, StreamKind};
use crate::frame_queue::Frame;
use crate::player::{ErrorSlot, PlayerError};
use crate::signal::{Cancelled, DecodeResult, ExitFlag};
use crate::stream_unit::StreamUnit;
use crate::sync::{AtomicPts, ClockSet, Pts};

/// Tolerance when comparing frame timestamps against a seek target
pub const PTS_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum SeekError {
    #[error("Container could not seek {kind:?} stream to {target}: {source}")]
    Container {
        kind: StreamKind,
        target: i64,
        source: SourceError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Playing,
    WaitingForEndOfStream,
    SeekRequested,
    SeekingToStartFrame,
    SeekingToTargetFrame,
}

// ============================================================================
// Seek control (shared with the player)
// ============================================================================

/// Pending seek request and in-progress flag, written by the player and read
/// by the demux driver.
#[derive(Default)]
pub(crate) struct SeekControl {
    pending: Mutex<PendingSeek>,
    in_progress: AtomicBool,
    target: AtomicPts,
}

#[derive(Default)]
struct PendingSeek {
    target: Option<f64>,
    /// The driver has exited and will not pick up requests
    closed: bool,
}

impl SeekControl {
    /// Queue a seek for the driver. Returns false once the driver has closed
    /// the control.
    pub(crate) fn request(&self, target: f64) -> bool {
        let mut pending = self.pending.lock();
        if pending.closed {
            return false;
        }
        pending.target = Some(target);
        self.target.store(Pts::Secs(target));
        self.in_progress.store(true, Ordering::SeqCst);
        true
    }

    fn take(&self) -> Option<f64> {
        self.pending.lock().target.take()
    }

    /// Stop accepting requests, unless one is already waiting.
    fn close(&self) -> bool {
        let mut pending = self.pending.lock();
        if pending.target.is_some() {
            return false;
        }
        pending.closed = true;
        true
    }

    /// Mark an internally started seek (loop restart) as in progress.
    fn begin_internal(&self, target: f64) {
        self.target.store(Pts::Secs(target));
        self.in_progress.store(true, Ordering::SeqCst);
    }

    /// A newer request keeps the seek in progress.
    fn complete(&self) {
        let pending = self.pending.lock();
        if pending.target.is_none() {
            self.in_progress.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn reset(&self) {
        let mut pending = self.pending.lock();
        *pending = PendingSeek::default();
        self.in_progress.store(false, Ordering::SeqCst);
        self.target.store(Pts::Unset);
    }

    pub(crate) fn is_seeking(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub(crate) fn target(&self) -> Pts {
        self.target.load()
    }
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Driving {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy)]
struct SeekSession {
    target: f64,
    driving: Driving,
    fell_back: bool,
    /// Container seek position in driving-stream units; starts at the target
    /// and only ever moves backward.
    keyframe_cursor: Option<i64>,
    generation: u64,
    source_exhausted: bool,
}

enum Produced {
    Routed(StreamId),
    Ignored,
    EndOfFile,
}

enum Halt {
    Cancelled,
    Finished,
    /// A decode worker already recorded its error
    WorkerFailed,
    Failed(PlayerError),
}

impl From<Cancelled> for Halt {
    fn from(_: Cancelled) -> Self {
        Halt::Cancelled
    }
}

impl From<SourceError> for Halt {
    fn from(err: SourceError) -> Self {
        Halt::Failed(PlayerError::Source(err))
    }
}

pub(crate) struct DemuxDriver {
    container: Box<dyn Container>,
    video: Arc<StreamUnit>,
    /// Present only while audio is decoded
    audio: Option<Arc<StreamUnit>>,
    clocks: Arc<ClockSet>,
    control: Arc<SeekControl>,
    errors: Arc<ErrorSlot>,
    exit: Arc<ExitFlag>,
    loop_playback: bool,
    state: DriverState,
    session: Option<SeekSession>,
    generation: u64,
    chunks_read: Arc<AtomicU64>,
}

impl DemuxDriver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        container: Box<dyn Container>,
        video: Arc<StreamUnit>,
        audio: Option<Arc<StreamUnit>>,
        clocks: Arc<ClockSet>,
        control: Arc<SeekControl>,
        errors: Arc<ErrorSlot>,
        exit: Arc<ExitFlag>,
        loop_playback: bool,
        chunks_read: Arc<AtomicU64>,
    ) -> Self {
        Self {
            container,
            video,
            audio,
            clocks,
            control,
            errors,
            exit,
            loop_playback,
            state: DriverState::Playing,
            session: None,
            generation: 0,
            chunks_read,
        }
    }

    /// Run until exit, end of source or a fatal error. Hands the container
    /// back for the next run.
    pub(crate) fn run(mut self) -> Box<dyn Container> {
        info!(target: "cadence::demux", audio = self.audio.is_some(), looping = self.loop_playback, "demux driver started");
        loop {
            if self.exit.is_requested() {
                break;
            }
            let step = match self.state {
                DriverState::Playing => self.play(),
                DriverState::WaitingForEndOfStream => self.wait_for_end_of_stream(),
                DriverState::SeekRequested => self.seek_container(),
                DriverState::SeekingToStartFrame => self.seek_to_start_frame(),
                DriverState::SeekingToTargetFrame => self.seek_to_target_frame(),
            };
            match step {
                Ok(()) => {}
                Err(Halt::Cancelled) => {
                    debug!(target: "cadence::demux", state = ?self.state, "demux driver cancelled");
                    break;
                }
                Err(Halt::Finished) => {
                    info!(target: "cadence::demux", "source exhausted, demux driver done");
                    break;
                }
                Err(Halt::WorkerFailed) => {
                    debug!(target: "cadence::demux", "decode worker failed, demux driver stopping");
                    break;
                }
                Err(Halt::Failed(err)) => {
                    error!(target: "cadence::demux", %err, "demux driver failed");
                    self.errors.record(err);
                    break;
                }
            }
        }
        self.container
    }

    fn set_state(&mut self, state: DriverState) {
        trace!(target: "cadence::demux", from = ?self.state, to = ?state, "state change");
        self.state = state;
    }

    /// Units in acknowledgement order: audio first, then video
    fn units(&self) -> impl Iterator<Item = &Arc<StreamUnit>> {
        self.audio.iter().chain(std::iter::once(&self.video))
    }

    fn unit_for(&self, stream: StreamId) -> Option<&Arc<StreamUnit>> {
        self.units().find(|unit| unit.stream_id() == stream)
    }

    fn driving_unit(&self, driving: Driving) -> Arc<StreamUnit> {
        match (driving, &self.audio) {
            (Driving::Audio, Some(audio)) => Arc::clone(audio),
            _ => Arc::clone(&self.video),
        }
    }

    /// Read one chunk and route it. Chunks of unhandled streams are dropped.
    fn produce(&mut self) -> Result<Produced, Halt> {
        let Some(packet) = self.container.read_next_chunk()? else {
            return Ok(Produced::EndOfFile);
        };
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        let stream = packet.stream;
        let Some(unit) = self.unit_for(stream) else {
            return Ok(Produced::Ignored);
        };
        if !unit.add_chunk(packet, &self.exit) {
            return Err(Halt::Cancelled);
        }
        Ok(Produced::Routed(stream))
    }

    fn push_end_of_stream(&self) {
        for unit in self.units() {
            unit.add_end_of_stream();
        }
    }

    // ========================================================================
    // Playing / looping
    // ========================================================================

    fn play(&mut self) -> Result<(), Halt> {
        if let Some(target) = self.control.take() {
            self.begin_session(target);
            return Ok(());
        }
        match self.produce()? {
            Produced::Routed(_) | Produced::Ignored => Ok(()),
            Produced::EndOfFile => {
                debug!(target: "cadence::demux", "end of container");
                self.push_end_of_stream();
                if self.loop_playback {
                    self.set_state(DriverState::WaitingForEndOfStream);
                    return Ok(());
                }
                if !self.control.close() {
                    // A request arrived meanwhile, the next step handles it
                    return Ok(());
                }
                for unit in self.units() {
                    unit.add_source_exhausted();
                }
                Err(Halt::Finished)
            }
        }
    }

    /// Loop restart: every decoder has flushed its tail and every regular
    /// queue has been consumed, then seek back to zero. A seek request
    /// interrupts the drain wait and takes precedence.
    fn wait_for_end_of_stream(&mut self) -> Result<(), Halt> {
        for unit in self.units() {
            unit.wait_end_of_stream(&self.exit)?;
        }
        for unit in self.units() {
            if !unit.wait_frames_drained(&self.exit) {
                break;
            }
        }
        if self.exit.is_requested() {
            return Err(Halt::Cancelled);
        }
        match self.control.take() {
            Some(target) => self.begin_session(target),
            None => {
                info!(target: "cadence::demux", "looping playback");
                self.control.begin_internal(0.0);
                self.begin_session(0.0);
            }
        }
        Ok(())
    }

    fn begin_session(&mut self, target: f64) {
        for unit in self.units() {
            unit.reset_drain_wait();
        }
        let driving = if self.audio.is_some() { Driving::Audio } else { Driving::Video };
        debug!(target: "cadence::demux", target, ?driving, "seek session started");
        self.session = Some(SeekSession {
            target,
            driving,
            fell_back: false,
            keyframe_cursor: None,
            generation: self.generation,
            source_exhausted: false,
        });
        self.set_state(DriverState::SeekRequested);
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Position the container, then flush every unit into its scratch queue.
    fn seek_container(&mut self) -> Result<(), Halt> {
        let Some(mut session) = self.session else {
            self.set_state(DriverState::Playing);
            return Ok(());
        };
        if let Some(target) = self.control.take() {
            // A newer request restarts the session
            self.begin_session(target);
            return Ok(());
        }

        let driving = self.driving_unit(session.driving);
        let descriptor = driving.descriptor();
        let cursor = session
            .keyframe_cursor
            .unwrap_or_else(|| descriptor.secs_to_ts(session.target));

        if let Err(source) = self.container.seek(descriptor.id, cursor, SeekDirection::Backward) {
            if session.driving == Driving::Audio && !session.fell_back {
                warn!(target: "cadence::demux", %source, "audio seek failed, retrying on video");
                session.driving = Driving::Video;
                session.fell_back = true;
                session.keyframe_cursor = None;
                self.session = Some(session);
                return Ok(());
            }
            return Err(Halt::Failed(PlayerError::Seek(SeekError::Container {
                kind: descriptor.kind,
                target: cursor,
                source,
            })));
        }
        trace!(target: "cadence::demux", stream = descriptor.id, cursor, "container positioned");

        self.generation += 1;
        session.generation = self.generation;
        session.source_exhausted = false;
        for unit in self.units() {
            unit.begin_seek(session.generation, Arc::ptr_eq(unit, &driving));
        }
        for unit in self.units() {
            unit.wait_seek_started(&self.exit)?;
        }
        self.session = Some(session);
        self.set_state(DriverState::SeekingToStartFrame);
        Ok(())
    }

    /// Read until one chunk of the driving stream has been queued.
    fn feed_driver(&mut self, session: &mut SeekSession, driving: &StreamUnit) -> Result<(), Halt> {
        loop {
            match self.produce()? {
                Produced::Routed(stream) if stream == driving.stream_id() => return Ok(()),
                Produced::Routed(_) | Produced::Ignored => {}
                Produced::EndOfFile => {
                    session.source_exhausted = true;
                    self.push_end_of_stream();
                    return Ok(());
                }
            }
        }
    }

    fn seek_to_start_frame(&mut self) -> Result<(), Halt> {
        let Some(mut session) = self.session else {
            self.set_state(DriverState::Playing);
            return Ok(());
        };
        let driving = self.driving_unit(session.driving);

        match driving.wait_decode_result(session.generation, &self.exit)? {
            // End of stream is queued; the decoder still flushes what it holds
            DecodeResult::NeedMoreInput if session.source_exhausted => {}
            DecodeResult::NeedMoreInput => self.feed_driver(&mut session, &driving)?,
            DecodeResult::EndOfStream => return self.finish_seek(session, Vec::new(), false),
            DecodeResult::Fatal => return Err(Halt::WorkerFailed),
            DecodeResult::FrameReady => {
                let Some(frame) = driving.pop_scratch() else {
                    return Ok(());
                };
                let at_stream_start = frame.first_chunk_dts <= driving.descriptor().start_ts();
                let overshot = match frame.pts {
                    Pts::Secs(pts) => pts > session.target + PTS_EPSILON,
                    Pts::Unset | Pts::Infinite => true,
                };
                if overshot && !at_stream_start {
                    let cursor = frame.first_chunk_dts - 1;
                    if session.keyframe_cursor.map_or(true, |previous| cursor < previous) {
                        debug!(target: "cadence::demux", pts = ?frame.pts, cursor, "landed past target, moving keyframe cursor back");
                        session.keyframe_cursor = Some(cursor);
                        self.session = Some(session);
                        self.set_state(DriverState::SeekRequested);
                        return Ok(());
                    }
                }
                let early = matches!(frame.pts, Pts::Secs(pts) if pts < session.target - PTS_EPSILON);
                if !early {
                    return self.finish_seek(session, vec![frame], true);
                }
                self.set_state(DriverState::SeekingToTargetFrame);
            }
        }
        self.session = Some(session);
        Ok(())
    }

    fn seek_to_target_frame(&mut self) -> Result<(), Halt> {
        let Some(mut session) = self.session else {
            self.set_state(DriverState::Playing);
            return Ok(());
        };
        let driving = self.driving_unit(session.driving);

        match driving.wait_decode_result(session.generation, &self.exit)? {
            // End of stream is queued; the decoder still flushes what it holds
            DecodeResult::NeedMoreInput if session.source_exhausted => {}
            DecodeResult::NeedMoreInput => self.feed_driver(&mut session, &driving)?,
            DecodeResult::EndOfStream => return self.finish_seek(session, Vec::new(), false),
            DecodeResult::Fatal => return Err(Halt::WorkerFailed),
            DecodeResult::FrameReady => {
                if let Some(frame) = driving.pop_scratch() {
                    let reached = match frame.pts {
                        Pts::Secs(pts) => pts >= session.target - PTS_EPSILON,
                        Pts::Unset | Pts::Infinite => true,
                    };
                    if reached {
                        return self.finish_seek(session, vec![frame], true);
                    }
                }
            }
        }
        self.session = Some(session);
        Ok(())
    }

    /// Hand the landing frames to the driving unit and resume playback.
    ///
    /// With `drain`, frames the decoder can still produce without more input
    /// are collected as extra landing frames first.
    fn finish_seek(&mut self, session: SeekSession, mut landing: Vec<Frame>, drain: bool) -> Result<(), Halt> {
        let driving = self.driving_unit(session.driving);
        if drain {
            loop {
                match driving.wait_decode_result(session.generation, &self.exit)? {
                    DecodeResult::FrameReady => landing.extend(driving.pop_scratch()),
                    DecodeResult::NeedMoreInput | DecodeResult::EndOfStream => break,
                    DecodeResult::Fatal => return Err(Halt::WorkerFailed),
                }
            }
        }
        for frame in &mut landing {
            if !frame.pts.is_set() {
                frame.pts = Pts::Secs(session.target);
            }
        }

        let landed = landing.first().map(|frame| frame.pts);
        let count = landing.len();
        let mut landing = Some(landing);
        for unit in self.units() {
            let frames = if Arc::ptr_eq(unit, &driving) {
                landing.take().unwrap_or_default()
            } else {
                Vec::new()
            };
            unit.end_seek(session.target, frames);
        }
        self.clocks.reset_audio();
        self.control.complete();
        self.session = None;
        info!(target: "cadence::demux", target = session.target, landed = ?landed, frames = count, "seek finished");
        self.set_state(DriverState::Playing);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_control_request_and_complete() {
        let control = SeekControl::default();
        assert!(!control.is_seeking());

        assert!(control.request(2.5));
        assert!(control.is_seeking());
        assert_eq!(control.target(), Pts::Secs(2.5));
        assert_eq!(control.take(), Some(2.5));
        assert_eq!(control.take(), None);

        control.complete();
        assert!(!control.is_seeking());
    }

    #[test]
    fn test_newer_request_keeps_seek_in_progress() {
        let control = SeekControl::default();
        control.request(1.0);
        control.take();
        control.request(4.0);
        control.complete();
        assert!(control.is_seeking());
        assert_eq!(control.target(), Pts::Secs(4.0));
    }

    #[test]
    fn test_closed_control_refuses_requests() {
        let control = SeekControl::default();
        control.request(1.0);
        assert!(!control.close());
        control.take();
        assert!(control.close());
        assert!(!control.request(3.0));

        control.reset();
        assert!(control.request(3.0));
        assert_eq!(control.target(), Pts::Secs(3.0));
    }

    #[test]
    fn test_internal_seek_reports_target() {
        let control = SeekControl::default();
        control.begin_internal(0.0);
        assert!(control.is_seeking());
        assert_eq!(control.target(), Pts::Secs(0.0));
        control.complete();
        assert!(!control.is_seeking());
    }
}
