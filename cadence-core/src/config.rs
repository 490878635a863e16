//! Engine configuration, loadable from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling for compressed bytes queued across all streams
    pub chunk_budget_bytes: u64,
    /// Regular frame queue capacity per stream
    pub frame_queue_capacity: usize,
    /// Scratch frame queue capacity per stream (oldest evicted beyond this)
    pub scratch_queue_capacity: usize,
    /// Restart from zero after the last frame
    pub loop_playback: bool,
    /// Multiplier applied to the system clock delta
    pub speed: f64,
    /// Decode and drive presentation from the audio stream when present
    pub decode_audio: bool,
    /// A `tick` delta above this resyncs the system clock to the next frame
    pub max_tick_delta_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_budget_bytes: 16 * 1024 * 1024,
            frame_queue_capacity: 16,
            scratch_queue_capacity: 64,
            loop_playback: false,
            speed: 1.0,
            decode_audio: true,
            max_tick_delta_secs: 1.0,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_budget_bytes == 0 {
            return Err(ConfigError::Invalid("chunk_budget_bytes must be positive".into()));
        }
        if self.frame_queue_capacity == 0 || self.scratch_queue_capacity == 0 {
            return Err(ConfigError::Invalid("frame queue capacities must be positive".into()));
        }
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return Err(ConfigError::Invalid(format!("speed must be positive, got {}", self.speed)));
        }
        if !(self.max_tick_delta_secs.is_finite() && self.max_tick_delta_secs > 0.0) {
            return Err(ConfigError::Invalid("max_tick_delta_secs must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_queue_capacity, 16);
        assert_eq!(config.chunk_budget_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "loop_playback": true, "speed": 2.0 }"#).unwrap();
        assert!(config.loop_playback);
        assert_eq!(config.speed, 2.0);
        assert_eq!(config.scratch_queue_capacity, 64);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");
        let config = EngineConfig {
            decode_audio: false,
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "speed": 0.0 }"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse(_))));

        let missing = dir.path().join("missing.json");
        assert!(matches!(EngineConfig::load(&missing), Err(ConfigError::Read { .. })));
    }
}
