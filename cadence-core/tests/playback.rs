mod common;

use cadence_core::{EngineConfig, Pts, PlayerError, SyntheticClip, SyntheticStream};
use common::{assert_close, open, secs, wait_for, wait_ready};

fn ten_frames() -> SyntheticClip {
    SyntheticClip {
        video: SyntheticStream::video(10, 100),
        ..SyntheticClip::default()
    }
}

#[test]
fn test_ticks_present_frames_in_order() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 5);

    let shown: Vec<f64> = (0..5)
        .map(|_| secs(&player.tick(0.1).unwrap().expect("frame due")))
        .collect();
    for (actual, expected) in shown.iter().zip([0.0, 0.1, 0.2, 0.3, 0.4]) {
        assert_close(*actual, expected);
    }
    assert_eq!(player.stats().frames_dropped, 0);
    assert_eq!(player.stats().frames_presented, 5);
}

#[test]
fn test_seek_after_source_exhausted_restarts() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 5);
    for _ in 0..5 {
        player.tick(0.1).unwrap();
    }

    player.seek(0.5).unwrap();
    wait_ready(&player, 1);
    let frame = player.tick(0.0).unwrap().expect("landing frame");
    assert_close(secs(&frame), 0.5);
}

#[test]
fn test_playback_finishes_and_stops() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 1);

    let mut last = None;
    assert!(wait_for(|| {
        if let Some(frame) = player.tick(0.1).unwrap() {
            last = Some(secs(&frame));
        }
        !player.is_playing()
    }));
    assert_close(last.unwrap(), 0.9);
    assert!(player.tick(0.1).unwrap().is_none());
}

#[test]
fn test_looping_restarts_from_zero() {
    let clip = SyntheticClip {
        video: SyntheticStream::video(5, 100),
        ..SyntheticClip::default()
    };
    let config = EngineConfig {
        loop_playback: true,
        ..EngineConfig::default()
    };
    let (player, _backend) = open(clip, config);
    player.start(0.0).unwrap();
    wait_ready(&player, 1);

    let mut previous = -1.0;
    let mut wrapped = false;
    assert!(wait_for(|| {
        if let Some(frame) = player.tick(0.1).unwrap() {
            let now = secs(&frame);
            wrapped = now < previous;
            previous = now;
        }
        wrapped
    }));
    assert_close(previous, 0.0);
    assert!(player.is_playing());
}

#[test]
fn test_stop_is_idempotent() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 3);

    player.stop(true);
    let first = player.stats();
    let time = player.current_time();
    player.stop(true);
    let second = player.stats();

    assert!(!player.is_playing());
    assert!(!player.is_seeking());
    assert_eq!(first.video_frames_buffered, 0);
    assert_eq!(first.chunk_bytes_in_flight, 0);
    assert_eq!(second.video_frames_buffered, first.video_frames_buffered);
    assert_eq!(second.chunk_bytes_in_flight, first.chunk_bytes_in_flight);
    assert_eq!(player.current_time(), time);
}

#[test]
fn test_position_survives_stop_without_queries() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 3);
    for _ in 0..3 {
        player.tick(0.1).unwrap();
    }

    player.stop(true);
    assert_close(player.current_time(), 0.2);
}

#[test]
fn test_repeated_non_blocking_stop_leaves_nothing_queued() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 2);

    player.stop(false);
    player.stop(false);
    player.stop(true);
    let stats = player.stats();
    assert_eq!(stats.video_frames_buffered, 0);
    assert_eq!(stats.chunk_bytes_in_flight, 0);
}

#[test]
fn test_non_blocking_stop_then_restart() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 2);
    player.stop(false);

    player.start(0.3).unwrap();
    wait_ready(&player, 1);
    let frame = player.tick(0.0).unwrap().expect("frame after restart");
    assert_close(secs(&frame), 0.3);
}

#[test]
fn test_large_tick_resyncs_to_next_frame() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.start(0.0).unwrap();
    wait_ready(&player, 4);

    assert_close(secs(&player.tick(0.1).unwrap().unwrap()), 0.0);
    let frame = player.tick(30.0).unwrap().expect("resynced frame");
    assert_close(secs(&frame), 0.1);
    assert_eq!(player.stats().frames_dropped, 0);
}

#[test]
fn test_speed_scales_system_clock() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    player.set_speed(2.0).unwrap();
    assert!(player.set_speed(0.0).is_err());
    player.start(0.0).unwrap();
    wait_ready(&player, 3);

    assert_close(secs(&player.tick(0.05).unwrap().unwrap()), 0.0);
    assert_close(secs(&player.tick(0.05).unwrap().unwrap()), 0.1);
}

#[test]
fn test_budget_and_queue_bounds_hold() {
    let clip = SyntheticClip {
        video: SyntheticStream::video(100, 40),
        ..SyntheticClip::default()
    };
    let config = EngineConfig {
        chunk_budget_bytes: 1_024,
        ..EngineConfig::default()
    };
    let (player, _backend) = open(clip, config);
    player.start(0.0).unwrap();

    let mut max_buffered = 0;
    assert!(wait_for(|| {
        player.tick(0.04).unwrap();
        max_buffered = max_buffered.max(player.stats().video_frames_buffered);
        !player.is_playing()
    }));
    let stats = player.stats();
    assert!(stats.chunk_budget_peak <= 1_024, "peak {}", stats.chunk_budget_peak);
    assert!(max_buffered <= 16);
    assert_eq!(stats.chunks_read, 100);
}

#[test]
fn test_fatal_decode_error_surfaces_on_tick() {
    let clip = SyntheticClip {
        video: SyntheticStream {
            fail_decode_at: Some(3),
            ..SyntheticStream::video(10, 100)
        },
        ..SyntheticClip::default()
    };
    let (player, _backend) = open(clip, EngineConfig::default());
    player.start(0.0).unwrap();

    let mut failure = None;
    assert!(wait_for(|| match player.tick(0.1) {
        Err(err) => {
            failure = Some(err);
            true
        }
        Ok(_) => false,
    }));
    assert!(matches!(failure, Some(PlayerError::Decode { .. })));
    assert!(!player.is_playing());
    assert!(player.last_error().unwrap().contains("injected failure"));
}

#[test]
fn test_open_unknown_media_fails() {
    let backend = cadence_core::SyntheticBackend::new();
    let result = cadence_core::Player::open(&backend, "movie.mkv", EngineConfig::default());
    assert!(matches!(result, Err(PlayerError::Open(_))));
}

#[test]
fn test_metadata_getters() {
    let (player, _backend) = open(ten_frames(), EngineConfig::default());
    assert_eq!(player.width(), 16);
    assert_eq!(player.height(), 16);
    assert_close(player.frame_rate().unwrap(), 10.0);
    assert_close(player.duration().unwrap(), 1.0);
    assert!(!player.has_audio());
    assert_eq!(player.current_time(), 0.0);
    assert_eq!(player.tick(0.1).unwrap().map(|frame| frame.pts), None::<Pts>);
}
