#![allow(dead_code)]

use std::time::{Duration, Instant};

use cadence_core::{EngineConfig, Frame, Player, Pts, SyntheticBackend, SyntheticClip};

pub const CLIP: &str = "clip.synthetic";

pub fn open(clip: SyntheticClip, config: EngineConfig) -> (Player, SyntheticBackend) {
    let backend = SyntheticBackend::with_clip(CLIP, clip);
    let player = Player::open(&backend, CLIP, config).expect("open synthetic clip");
    (player, backend)
}

/// Poll `condition` for up to five seconds.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Wait until the pending seek has landed and `frames` video frames are queued.
pub fn wait_ready(player: &Player, frames: usize) {
    assert!(
        wait_for(|| !player.is_seeking() && player.stats().video_frames_buffered >= frames),
        "player never buffered {frames} frames (stats: {:?})",
        player.stats()
    );
}

pub fn secs(frame: &Frame) -> f64 {
    match frame.pts {
        Pts::Secs(secs) => secs,
        other => panic!("frame without timestamp: {other:?}"),
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-6, "expected {expected}, got {actual}");
}
