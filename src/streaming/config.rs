//! Streaming ranges and policies

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// How a chunk above its desired tier is brought down
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemotionPolicy {
    /// Release everything above the desired tier at once
    #[default]
    Direct,
    /// Drop one tier per frame
    StepDown,
}

/// Configuration of a [`ChunkStreamManager`](super::ChunkStreamManager)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Chunks within this Chebyshev distance of an actor get GPU buffers
    pub render_range: u32,
    /// Chunks within this distance keep a CPU mesh. Never below `render_range`.
    pub simulation_range: u32,
    /// Frames a chunk may stay untouched before it falls back to `DataOnly`
    pub untouched_grace_frames: u32,
    pub demotion: DemotionPolicy,
    /// Mesh uploads allowed per frame, at least 1
    pub max_uploads_per_frame: usize,
    /// Worker thread override; `None` picks from the core count
    pub worker_threads: Option<usize>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            render_range: 2,
            simulation_range: 5,
            untouched_grace_frames: 0,
            demotion: DemotionPolicy::Direct,
            max_uploads_per_frame: 64,
            worker_threads: None,
        }
    }
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.simulation_range < self.render_range {
            return Err(Error::Config(format!(
                "simulation_range {} is smaller than render_range {}",
                self.simulation_range, self.render_range
            )));
        }
        if self.max_uploads_per_frame == 0 {
            return Err(Error::Config("max_uploads_per_frame must be at least 1".into()));
        }
        if self.worker_threads == Some(0) {
            return Err(Error::Config("worker_threads must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded streaming config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamingConfig::default();
        assert_eq!(config.render_range, 2);
        assert_eq!(config.simulation_range, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_simulation_inside_render() {
        let config = StreamingConfig {
            render_range: 4,
            simulation_range: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_upload_budget() {
        let config = StreamingConfig {
            max_uploads_per_frame: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            StreamingConfig::from_json_str(r#"{ "render_range": 1, "demotion": "step_down" }"#)
                .unwrap();
        assert_eq!(config.render_range, 1);
        assert_eq!(config.simulation_range, 5);
        assert_eq!(config.demotion, DemotionPolicy::StepDown);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("streaming.json");
        let config = StreamingConfig {
            render_range: 3,
            simulation_range: 6,
            untouched_grace_frames: 10,
            worker_threads: Some(2),
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(StreamingConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "render_range": 9, "simulation_range": 1 }"#).unwrap();
        assert!(matches!(StreamingConfig::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(StreamingConfig::load(&path), Err(Error::Json(_))));
    }
}
