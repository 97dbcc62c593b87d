// SPDX-License-Identifier: GPL-3.0-only

use crate::constants::{encoding, queue, thumbnail};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Saver configuration
///
/// Loaded from JSON; every field is optional in the file and falls back to
/// [`SaverConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    /// Directory photos are written to
    pub output_dir: PathBuf,
    /// Queue slots ahead of the request in flight
    pub queue_capacity: usize,
    /// On-screen width thumbnails are sized for
    pub preview_width: u32,
    /// Override for the number of HDR fusion threads (None = all cores)
    pub hdr_threads: Option<usize>,
    /// Default for the per-request GPS timestamp correction
    pub fix_gps_timestamp: bool,
    /// JPEG quality used when a request does not specify one
    pub default_jpeg_quality: u8,
    /// Name given to the saver worker thread
    pub worker_name: String,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            queue_capacity: queue::DEFAULT_CAPACITY,
            preview_width: thumbnail::DEFAULT_PREVIEW_WIDTH,
            hdr_threads: None,
            fix_gps_timestamp: false,
            default_jpeg_quality: encoding::DEFAULT_JPEG_QUALITY,
            worker_name: queue::WORKER_NAME.to_string(),
        }
    }
}

impl SaverConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON configuration string
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SaverConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.preview_width == 0 {
            return Err(ConfigError::Invalid {
                field: "preview_width",
                reason: "must be non-zero".to_string(),
            });
        }
        if !(1..=100).contains(&self.default_jpeg_quality) {
            return Err(ConfigError::Invalid {
                field: "default_jpeg_quality",
                reason: format!("{} is outside 1-100", self.default_jpeg_quality),
            });
        }
        if self.hdr_threads == Some(0) {
            return Err(ConfigError::Invalid {
                field: "hdr_threads",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}

/// ~/Pictures/camera, or ./camera when no picture directory is known
fn default_output_dir() -> PathBuf {
    dirs::picture_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camera")
}
