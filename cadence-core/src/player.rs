//! # Player - Engine Facade
//!
//! Owns one opened media file and the threads decoding it:
//!
//! ```text
//!                       ┌──────────────────┐
//!   container ─────────►│ demux driver     │ cadence-demux
//!                       └──┬────────────┬──┘
//!                chunks    │            │    chunks
//!                  ┌───────▼──┐    ┌────▼─────┐
//!                  │ video    │    │ audio    │ cadence-decode-*
//!                  │ unit     │    │ unit     │
//!                  └───────┬──┘    └────┬─────┘
//!                 tick()   │            │ fill_audio_buffer()
//!                  ◄───────┘            └──────► host audio device
//! ```
//!
//! Every method takes `&self`, so a player can be shared between the thread
//! calling `tick` and the host's audio callback.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::audio::{AudioError, AudioFormat, AudioOutput};
use crate::budget::ChunkBudget;
use crate::config::{ConfigError, EngineConfig};
use crate::decode::DecodeError;
use crate::demux::{DemuxDriver, SeekControl, SeekError};
use crate::demuxer::{Container, MediaBackend, OpenError, OpenedMedia, SourceError, StreamDescriptor, StreamKind};
use crate::frame_queue::{Frame, QueueListener};
use crate::signal::ExitFlag;
use crate::stream_unit::StreamUnit;
use crate::sync::{AtomicPts, ClockSet, Pts};

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Seek failed: {0}")]
    Seek(#[from] SeekError),
    #[error("{stream:?} decoder failed: {source}")]
    Decode { stream: StreamKind, source: DecodeError },
    #[error("Container read failed: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("Failed to spawn {name}: {source}")]
    Spawn { name: String, source: std::io::Error },
    #[error("The {0} was lost by a previous playback run")]
    Unavailable(&'static str),
}

/// First error raised on any engine thread, reported by the next `tick`.
#[derive(Default)]
pub(crate) struct ErrorSlot(Mutex<Option<PlayerError>>);

impl ErrorSlot {
    pub(crate) fn record(&self, err: PlayerError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take(&self) -> Option<PlayerError> {
        self.0.lock().take()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().take();
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PlayerStats {
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub video_frames_buffered: usize,
    pub audio_frames_buffered: usize,
    pub chunk_bytes_in_flight: u64,
    pub chunk_budget_peak: u64,
    pub chunk_budget_ceiling: u64,
    pub chunks_read: u64,
}

// ============================================================================
// Queue listeners
// ============================================================================

/// A cleared video queue invalidates the system clock; it is reseeded from
/// the next frame.
struct VideoClockReset(Arc<ClockSet>);

impl QueueListener for VideoClockReset {
    fn frame_queue_cleared(&self) {
        self.0.set_system(Pts::Unset);
    }
}

/// A cleared audio queue invalidates the audio clocks and whatever the audio
/// output still buffers.
struct AudioClockReset {
    clocks: Arc<ClockSet>,
    discard: Arc<AtomicBool>,
}

impl QueueListener for AudioClockReset {
    fn frame_queue_cleared(&self) {
        self.clocks.reset_audio();
        self.discard.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Player
// ============================================================================

struct Worker {
    exit: Arc<ExitFlag>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Threads {
    demux: Option<Worker>,
    decoders: Vec<Worker>,
}

pub struct Player {
    path: PathBuf,
    config: EngineConfig,
    streams: Vec<StreamDescriptor>,
    video: Arc<StreamUnit>,
    audio: Option<Arc<StreamUnit>>,
    clocks: Arc<ClockSet>,
    budget: Arc<ChunkBudget>,
    control: Arc<SeekControl>,
    errors: Arc<ErrorSlot>,
    /// Parked here between runs; the demux thread owns it while running
    container: Arc<Mutex<Option<Box<dyn Container>>>>,
    threads: Mutex<Threads>,
    playing: AtomicBool,
    demux_done: Arc<AtomicBool>,
    audio_running: AtomicBool,
    decode_audio: AtomicBool,
    looping: AtomicBool,
    speed: AtomicU64,
    last_time: AtomicPts,
    audio_out: Mutex<AudioOutput>,
    last_error: Mutex<Option<String>>,
    chunks_read: Arc<AtomicU64>,
}

impl Player {
    /// Open `path` with `backend`. Fails if the media has no video stream.
    /// A missing or unusable audio decoder downgrades to video-only.
    pub fn open(backend: &dyn MediaBackend, path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, PlayerError> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let OpenedMedia { container, streams } = backend.open(&path)?;

        let video_stream = streams
            .iter()
            .find(|stream| stream.kind == StreamKind::Video)
            .cloned()
            .ok_or(OpenError::NoVideoStream)?;
        let audio_stream = streams.iter().find(|stream| stream.kind == StreamKind::Audio).cloned();

        let clocks = Arc::new(ClockSet::new());
        let budget = Arc::new(ChunkBudget::new(config.chunk_budget_bytes));
        let errors = Arc::new(ErrorSlot::default());
        let discard = Arc::new(AtomicBool::new(false));

        let video_decoder = container.create_decoder(&video_stream)?;
        let video = Arc::new(StreamUnit::new(
            video_stream,
            video_decoder,
            Arc::clone(&budget),
            &config,
            Some(Arc::new(VideoClockReset(Arc::clone(&clocks))) as Arc<dyn QueueListener>),
            Arc::clone(&errors),
        ));

        let audio = match audio_stream {
            Some(stream) => match container.create_decoder(&stream) {
                Ok(decoder) => {
                    let listener = AudioClockReset {
                        clocks: Arc::clone(&clocks),
                        discard: Arc::clone(&discard),
                    };
                    Some(Arc::new(StreamUnit::new(
                        stream,
                        decoder,
                        Arc::clone(&budget),
                        &config,
                        Some(Arc::new(listener) as Arc<dyn QueueListener>),
                        Arc::clone(&errors),
                    )))
                }
                Err(err) => {
                    warn!(target: "cadence::player", %err, "audio decoder unavailable, playing video only");
                    None
                }
            },
            None => None,
        };

        info!(
            target: "cadence::player",
            path = %path.display(),
            backend = backend.name(),
            streams = streams.len(),
            audio = audio.is_some(),
            "media opened"
        );

        Ok(Self {
            path,
            streams,
            video,
            audio,
            clocks,
            budget,
            control: Arc::new(SeekControl::default()),
            errors,
            container: Arc::new(Mutex::new(Some(container))),
            threads: Mutex::new(Threads::default()),
            playing: AtomicBool::new(false),
            demux_done: Arc::new(AtomicBool::new(false)),
            audio_running: AtomicBool::new(false),
            decode_audio: AtomicBool::new(config.decode_audio),
            looping: AtomicBool::new(config.loop_playback),
            speed: AtomicU64::new(config.speed.to_bits()),
            last_time: AtomicPts::new(Pts::Unset),
            audio_out: Mutex::new(AudioOutput::new(discard)),
            last_error: Mutex::new(None),
            chunks_read: Arc::new(AtomicU64::new(0)),
            config,
        })
    }

    // ========================================================================
    // Playback control
    // ========================================================================

    /// Start (or restart) playback at `at` seconds.
    pub fn start(&self, at: f64) -> Result<(), PlayerError> {
        self.stop(true);
        let target = self.clamp_target(at);
        let container = self
            .container
            .lock()
            .take()
            .ok_or(PlayerError::Unavailable("container"))?;
        let audio = self.audio.as_ref().filter(|_| self.decode_audio()).cloned();

        self.errors.clear();
        self.control.request(target);
        self.demux_done.store(false, Ordering::SeqCst);
        self.audio_running.store(audio.is_some(), Ordering::SeqCst);
        self.last_time.store(Pts::Secs(target));

        let mut threads = self.threads.lock();
        for unit in std::iter::once(&self.video).chain(audio.iter()) {
            let exit = Arc::new(ExitFlag::new());
            match unit.spawn_worker(Arc::clone(&exit)) {
                Ok(handle) => threads.decoders.push(Worker { exit, handle }),
                Err(err) => {
                    drop(threads);
                    *self.container.lock() = Some(container);
                    self.stop(true);
                    return Err(err);
                }
            }
        }

        let exit = Arc::new(ExitFlag::new());
        let driver = DemuxDriver::new(
            container,
            Arc::clone(&self.video),
            audio.clone(),
            Arc::clone(&self.clocks),
            Arc::clone(&self.control),
            Arc::clone(&self.errors),
            Arc::clone(&exit),
            self.looping.load(Ordering::SeqCst),
            Arc::clone(&self.chunks_read),
        );
        let slot = Arc::clone(&self.container);
        let done = Arc::clone(&self.demux_done);
        let spawned = thread::Builder::new()
            .name("cadence-demux".into())
            .spawn(move || {
                let container = driver.run();
                *slot.lock() = Some(container);
                done.store(true, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => threads.demux = Some(Worker { exit, handle }),
            Err(source) => {
                drop(threads);
                self.stop(true);
                return Err(PlayerError::Spawn {
                    name: "cadence-demux".into(),
                    source,
                });
            }
        }

        self.playing.store(true, Ordering::SeqCst);
        info!(target: "cadence::player", at = target, audio = audio.is_some(), "playback started");
        Ok(())
    }

    /// Stop playback. Safe to call repeatedly.
    ///
    /// With `blocking` the engine threads are joined before returning;
    /// otherwise they are only told to exit and get joined by the next
    /// `start` or blocking `stop`.
    pub fn stop(&self, blocking: bool) {
        let mut threads = self.threads.lock();
        let was_playing = self.playing.swap(false, Ordering::SeqCst);

        // Demux first, it may be waiting on a decode worker
        if let Some(demux) = &threads.demux {
            demux.exit.request();
        }
        self.budget.wake_all();
        self.wake_units();
        for worker in &threads.decoders {
            worker.exit.request();
        }
        self.wake_units();

        if blocking {
            if let Some(demux) = threads.demux.take() {
                join(demux);
            }
            for worker in threads.decoders.drain(..) {
                join(worker);
            }
        }
        drop(threads);

        for unit in self.units() {
            unit.clear();
        }
        self.clocks.reset_all();
        self.control.reset();
        self.audio_out.lock().reset();
        if was_playing {
            info!(target: "cadence::player", blocking, "playback stopped");
        }
    }

    /// Request a seek to `secs`. Restarts playback if the source was already
    /// played to the end.
    pub fn seek(&self, secs: f64) -> Result<(), PlayerError> {
        if !self.is_playing() {
            debug!(target: "cadence::player", secs, "seek ignored, not playing");
            return Ok(());
        }
        let target = self.clamp_target(secs);
        if !self.control.request(target) {
            info!(target: "cadence::player", target, "restarting finished playback for seek");
            return self.start(target);
        }
        for unit in self.units() {
            unit.interrupt_drain_wait();
        }
        info!(target: "cadence::player", target, "seek requested");
        Ok(())
    }

    /// Advance presentation by `delta_secs` of wall-clock time and return the
    /// frame to display, if a new one is due.
    pub fn tick(&self, delta_secs: f64) -> Result<Option<Frame>, PlayerError> {
        self.check_error()?;
        if !self.is_playing() {
            return Ok(None);
        }
        let clock = if self.audio_active() {
            self.clocks.audio_play()
        } else {
            self.advance_system_clock(delta_secs)
        };
        if let Pts::Secs(_) = clock {
            self.last_time.store(clock);
        }
        let frame = self.video.try_pop_ready(clock);
        match &frame {
            Some(frame) => trace!(target: "cadence::player", pts = ?frame.pts, clock = ?clock, "frame presented"),
            None if self.playback_finished() => {
                info!(target: "cadence::player", "playback finished");
                self.stop(true);
            }
            None => {}
        }
        Ok(frame)
    }

    fn advance_system_clock(&self, delta_secs: f64) -> Pts {
        let delta = delta_secs.max(0.0) * self.speed();
        if delta > self.config.max_tick_delta_secs {
            debug!(target: "cadence::player", delta, "tick delta too large, resyncing clock");
            self.clocks.set_system(Pts::Unset);
        } else {
            self.clocks.advance_system(delta);
        }
        if !self.clocks.system().is_set() {
            if let Some(front) = self.video.peek_front() {
                self.clocks.set_system(front);
            }
        }
        self.clocks.system()
    }

    fn playback_finished(&self) -> bool {
        if !self.demux_done.load(Ordering::SeqCst) || !self.video.is_finished() {
            return false;
        }
        match (&self.audio, self.audio_active()) {
            (Some(audio), true) => audio.is_finished(),
            _ => true,
        }
    }

    /// Report and stop on an error raised by an engine thread.
    fn check_error(&self) -> Result<(), PlayerError> {
        let Some(err) = self.errors.take() else {
            return Ok(());
        };
        error!(target: "cadence::player", %err, "playback failed");
        *self.last_error.lock() = Some(err.to_string());
        self.stop(true);
        Err(err)
    }

    /// Playback position in seconds. While a seek is in progress this is the
    /// seek target; when no clock is set it is the last known position.
    pub fn current_time(&self) -> f64 {
        if self.errors.is_set() {
            let _ = self.check_error();
        }
        if self.control.is_seeking() {
            if let Some(target) = self.control.target().secs() {
                return target;
            }
        }
        match self.clocks.presentation(self.audio_active()) {
            Pts::Secs(now) => {
                self.last_time.store(Pts::Secs(now));
                now
            }
            _ => self.last_time.load().secs().unwrap_or(0.0),
        }
    }

    /// Fill a host audio buffer in `format`. Returns false when no audio is
    /// being played (no audio stream, audio disabled, or stopped).
    pub fn fill_audio_buffer(&self, buffer: &mut [u8], format: &AudioFormat) -> bool {
        let Some(audio) = self.audio.as_ref() else {
            return false;
        };
        if !self.is_playing() || !self.audio_active() {
            return false;
        }
        let mut output = self.audio_out.lock();
        match output.fill(buffer, format, audio, &self.clocks) {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "cadence::player", %err, "audio conversion failed");
                self.errors.record(PlayerError::Audio(err));
                false
            }
        }
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Playback rate for the system clock. Audio-driven playback is not
    /// affected.
    pub fn set_speed(&self, speed: f64) -> Result<(), PlayerError> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(ConfigError::Invalid(format!("speed must be positive, got {speed}")).into());
        }
        self.speed.store(speed.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed.load(Ordering::SeqCst))
    }

    /// Takes effect on the next `start`.
    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::SeqCst);
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    /// Takes effect on the next `start`.
    pub fn set_decode_audio(&self, enabled: bool) {
        self.decode_audio.store(enabled, Ordering::SeqCst);
    }

    pub fn decode_audio(&self) -> bool {
        self.decode_audio.load(Ordering::SeqCst)
    }

    // ========================================================================
    // State & metadata
    // ========================================================================

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn is_seeking(&self) -> bool {
        self.control.is_seeking()
    }

    /// Audio is decoded and drives presentation
    pub fn audio_active(&self) -> bool {
        self.audio_running.load(Ordering::SeqCst)
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn width(&self) -> u32 {
        self.video.descriptor().width
    }

    pub fn height(&self) -> u32 {
        self.video.descriptor().height
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.video.descriptor().frame_rate?.as_f64()
    }

    /// Longest declared stream duration, in seconds
    pub fn duration(&self) -> Option<f64> {
        self.units()
            .filter_map(|unit| unit.descriptor().duration_secs())
            .reduce(f64::max)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn stats(&self) -> PlayerStats {
        let video = self.video.frame_stats();
        PlayerStats {
            frames_presented: video.presented,
            frames_dropped: video.dropped,
            video_frames_buffered: video.buffered,
            audio_frames_buffered: self.audio.as_ref().map_or(0, |audio| audio.frame_stats().buffered),
            chunk_bytes_in_flight: self.budget.in_use(),
            chunk_budget_peak: self.budget.peak(),
            chunk_budget_ceiling: self.budget.ceiling(),
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
        }
    }

    fn units(&self) -> impl Iterator<Item = &Arc<StreamUnit>> {
        self.audio.iter().chain(std::iter::once(&self.video))
    }

    fn wake_units(&self) {
        for unit in self.units() {
            unit.wake_all();
        }
    }

    fn clamp_target(&self, secs: f64) -> f64 {
        let secs = if secs.is_finite() { secs.max(0.0) } else { 0.0 };
        match self.duration() {
            Some(duration) => secs.min(duration),
            None => secs,
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn join(worker: Worker) {
    let name = worker.handle.thread().name().unwrap_or("engine").to_string();
    if worker.handle.join().is_err() {
        warn!(target: "cadence::player", thread = %name, "engine thread panicked");
    }
}
