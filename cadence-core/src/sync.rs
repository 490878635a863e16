//! Audio/Video Synchronization
//!
//! Three clocks drive presentation:
//! - the system clock, advanced by the wall-clock delta passed to `tick`
//! - the audio decode clock, end time of the newest block handed to the
//!   audio device
//! - the audio play clock, decode clock minus what is still buffered
//!
//! Video follows the audio play clock while audio is active and the system
//! clock otherwise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Presentation timestamp in seconds, zero at the stream start.
///
/// Ordered so that `Unset < Secs(_) < Infinite`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub enum Pts {
    /// Timing not known yet
    #[default]
    Unset,
    Secs(f64),
    /// Never expires
    Infinite,
}

impl Pts {
    pub fn is_set(self) -> bool {
        !matches!(self, Pts::Unset)
    }

    pub fn secs(self) -> Option<f64> {
        match self {
            Pts::Secs(secs) => Some(secs),
            _ => None,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Pts::Unset => f64::NAN.to_bits(),
            Pts::Secs(secs) => secs.to_bits(),
            Pts::Infinite => f64::INFINITY.to_bits(),
        }
    }

    fn from_bits(bits: u64) -> Self {
        let value = f64::from_bits(bits);
        if value.is_nan() {
            Pts::Unset
        } else if value == f64::INFINITY {
            Pts::Infinite
        } else {
            Pts::Secs(value)
        }
    }
}

/// Lock-free [`Pts`] cell
#[derive(Debug)]
pub struct AtomicPts(AtomicU64);

impl AtomicPts {
    pub fn new(pts: Pts) -> Self {
        Self(AtomicU64::new(pts.to_bits()))
    }

    pub fn load(&self) -> Pts {
        Pts::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, pts: Pts) {
        self.0.store(pts.to_bits(), Ordering::SeqCst);
    }
}

impl Default for AtomicPts {
    fn default() -> Self {
        Self::new(Pts::Unset)
    }
}

// ============================================================================
// Clock set
// ============================================================================

/// The engine's three clocks. Written by the consumer thread (`tick`), the
/// audio callback and the demux thread, hence atomics.
#[derive(Debug, Default)]
pub struct ClockSet {
    system: AtomicPts,
    audio_decode: AtomicPts,
    audio_play: AtomicPts,
}

impl ClockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system(&self) -> Pts {
        self.system.load()
    }

    pub fn set_system(&self, pts: Pts) {
        self.system.store(pts);
    }

    /// Advance the system clock by `delta` seconds. An unset clock stays
    /// unset until it is seeded from a frame.
    pub fn advance_system(&self, delta: f64) -> Pts {
        let next = match self.system.load() {
            Pts::Secs(now) => Pts::Secs(now + delta),
            other => other,
        };
        self.system.store(next);
        next
    }

    pub fn audio_decode(&self) -> Pts {
        self.audio_decode.load()
    }

    pub fn set_audio_decode(&self, pts: Pts) {
        self.audio_decode.store(pts);
    }

    pub fn audio_play(&self) -> Pts {
        self.audio_play.load()
    }

    pub fn set_audio_play(&self, pts: Pts) {
        self.audio_play.store(pts);
    }

    pub fn reset_audio(&self) {
        self.audio_decode.store(Pts::Unset);
        self.audio_play.store(Pts::Unset);
    }

    pub fn reset_all(&self) {
        self.system.store(Pts::Unset);
        self.reset_audio();
    }

    /// The clock video presentation follows
    pub fn presentation(&self, audio_active: bool) -> Pts {
        if audio_active {
            self.audio_play()
        } else {
            self.system()
        }
    }
}

// ============================================================================
// Tick pacing
// ============================================================================

/// Paces a consumer loop at a fixed rate and reports the wall-clock delta
/// between iterations, for hosts that drive `tick` from their own thread.
pub struct TickPacer {
    interval: Duration,
    last: Instant,
    ticks: u64,
}

impl TickPacer {
    pub fn new(rate_hz: f64) -> Self {
        let interval = if rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / rate_hz)
        } else {
            Duration::from_millis(16)
        };
        Self {
            interval,
            last: Instant::now(),
            ticks: 0,
        }
    }

    /// Sleep out the rest of the interval, then return seconds elapsed since
    /// the previous call.
    pub fn wait(&mut self) -> f64 {
        let elapsed = self.last.elapsed();
        if elapsed < self.interval {
            std::thread::sleep(self.interval - elapsed);
        }
        let now = Instant::now();
        let delta = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.ticks += 1;
        delta
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pts_ordering() {
        assert!(Pts::Unset < Pts::Secs(-5.0));
        assert!(Pts::Secs(0.1) < Pts::Secs(0.2));
        assert!(Pts::Secs(1e12) < Pts::Infinite);
        assert!(Pts::Unset < Pts::Infinite);
    }

    #[test]
    fn test_atomic_pts_sentinels() {
        let cell = AtomicPts::default();
        assert_eq!(cell.load(), Pts::Unset);
        cell.store(Pts::Infinite);
        assert_eq!(cell.load(), Pts::Infinite);
        cell.store(Pts::Secs(0.25));
        assert_eq!(cell.load(), Pts::Secs(0.25));
    }

    #[test]
    fn test_system_clock_advances_only_when_set() {
        let clocks = ClockSet::new();
        assert_eq!(clocks.advance_system(0.1), Pts::Unset);
        clocks.set_system(Pts::Secs(1.0));
        assert_eq!(clocks.advance_system(0.5), Pts::Secs(1.5));
    }

    #[test]
    fn test_presentation_clock_selection() {
        let clocks = ClockSet::new();
        clocks.set_system(Pts::Secs(2.0));
        clocks.set_audio_play(Pts::Secs(1.0));
        assert_eq!(clocks.presentation(true), Pts::Secs(1.0));
        assert_eq!(clocks.presentation(false), Pts::Secs(2.0));

        clocks.reset_audio();
        assert_eq!(clocks.presentation(true), Pts::Unset);
        clocks.reset_all();
        assert_eq!(clocks.system(), Pts::Unset);
    }

    #[test]
    fn test_tick_pacer_interval() {
        let mut pacer = TickPacer::new(200.0);
        let delta = pacer.wait();
        assert!(delta >= 0.004);
        assert_eq!(pacer.ticks(), 1);
    }
}
