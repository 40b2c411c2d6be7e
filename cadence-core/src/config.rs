//! Playback configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```json
//! { "max_depth": 8, "frame_drops": false }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Destination rectangle size on the display surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1280, height: 720 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Maximum converted frames waiting for presentation
    pub max_depth: usize,
    /// Discard frames that are late (but not hopelessly late)
    pub frame_drops: bool,
    /// Lag beyond which video decoding is abandoned (seconds)
    pub max_lag_secs: f64,
    /// Render loop polling interval (milliseconds)
    pub render_tick_ms: u64,
    /// Border added on every side of a converted frame (pixels)
    pub frame_padding: usize,
    /// Row stride alignment of converted frames (bytes)
    pub row_alignment: usize,
    /// Consecutive needs-more-input answers tolerated per decoded frame
    pub max_decode_retries: u32,
    pub viewport: Viewport,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            frame_drops: true,
            max_lag_secs: 5.0,
            render_tick_ms: 20,
            frame_padding: 4,
            row_alignment: 16,
            max_decode_retries: 64,
            viewport: Viewport::default(),
        }
    }
}

impl PlaybackConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        tracing::debug!("Loaded playback config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(out_of_range("max_depth", "must hold at least one frame"));
        }
        if self.render_tick_ms == 0 {
            return Err(out_of_range("render_tick_ms", "must be positive"));
        }
        if !(self.max_lag_secs > 0.0) {
            return Err(out_of_range("max_lag_secs", "must be a positive number of seconds"));
        }
        if self.row_alignment == 0 || !self.row_alignment.is_power_of_two() {
            return Err(out_of_range("row_alignment", "must be a power of two"));
        }
        if self.max_decode_retries == 0 {
            return Err(out_of_range("max_decode_retries", "must allow at least one retry"));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(out_of_range("viewport", "must not be empty"));
        }
        Ok(())
    }

    pub fn render_tick(&self) -> Duration {
        Duration::from_millis(self.render_tick_ms)
    }
}

fn out_of_range(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: reason.to_string(),
    }
}
