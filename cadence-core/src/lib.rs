//! # Cadence Core
//!
//! Threaded media decode and A/V synchronization engine. One demux thread
//! reads the container, one worker per elementary stream decodes it, and the
//! host pulls presentable video frames with `tick` and audio with
//! `fill_audio_buffer`.
//!
//! ```no_run
//! use cadence_core::{EngineConfig, Player, SyntheticBackend};
//!
//! let backend = SyntheticBackend::new();
//! let player = Player::open(&backend, "clip.json", EngineConfig::default())?;
//! player.start(0.0)?;
//! if let Some(frame) = player.tick(1.0 / 60.0)? {
//!     println!("show frame at {:?}", frame.pts);
//! }
//! # Ok::<(), cadence_core::PlayerError>(())
//! ```

// ============================================================================
// External Capabilities
// ============================================================================
pub mod decode;
pub mod demuxer;

// ============================================================================
// Queues & Signalling
// ============================================================================
pub mod budget;
pub mod chunk;
pub mod chunk_queue;
pub mod frame_queue;
pub mod signal;

// ============================================================================
// Engine
// ============================================================================
pub mod audio;
pub mod config;
pub mod demux;
pub mod player;
pub mod stream_unit;
pub mod sync;

// ============================================================================
// Test & Demo Media
// ============================================================================
pub mod synthetic;

pub use audio::{AudioError, AudioFormat, SampleFormat};
pub use config::{ConfigError, EngineConfig};
pub use decode::{DecodeError, FramePayload};
pub use demuxer::{MediaBackend, OpenError, StreamDescriptor, StreamKind};
pub use demux::SeekError;
pub use frame_queue::Frame;
pub use player::{Player, PlayerError, PlayerStats};
pub use sync::{Pts, TickPacer};
pub use synthetic::{SyntheticBackend, SyntheticClip, SyntheticStream};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
