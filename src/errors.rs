// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the photo-finishing pipeline
//!
//! Per-image failures ([`PhotoError`]) never abort sibling images of the same
//! batch, and metadata failures ([`MetadataError`]) are downgraded to log
//! lines by the saver: an image with incomplete tags is still a saved image.

use thiserror::Error;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for single-image operations
pub type PhotoResult<T> = Result<T, PhotoError>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Photo error: {0}")]
    Photo(#[from] PhotoError),
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Failures scoped to a single image of a save request
#[derive(Debug, Clone, Error)]
pub enum PhotoError {
    /// Corrupt, truncated or unsupported payload
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    /// JPEG/DNG encoding failed
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),
    /// Storage sink could not create or write the output
    #[error("Save failed: {0}")]
    SaveFailed(String),
    /// HDR fusion could not run on the decoded exposures
    #[error("HDR fusion failed: {0}")]
    Hdr(#[from] HdrError),
    /// Internal invariant violated (empty batch, wrong variant, ...)
    #[error("Invalid save request: {0}")]
    InvalidRequest(String),
}

/// HDR fusion input errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HdrError {
    #[error("exposure {index} is {width}x{height}, expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        index: usize,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
    #[error("exposures are empty")]
    EmptyImage,
}

/// Metadata read/write failures
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read tags: {0}")]
    Read(String),
    #[error("failed to write tags: {0}")]
    Write(String),
    #[error("temporary copy failed: {0}")]
    TempCopy(#[from] std::io::Error),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<std::io::Error> for PhotoError {
    fn from(err: std::io::Error) -> Self {
        PhotoError::SaveFailed(err.to_string())
    }
}

impl From<image::ImageError> for PhotoError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Decoding(e) => PhotoError::DecodeFailed(e.to_string()),
            image::ImageError::Encoding(e) => PhotoError::EncodingFailed(e.to_string()),
            image::ImageError::IoError(e) => PhotoError::SaveFailed(e.to_string()),
            other => PhotoError::DecodeFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_save_failed() {
        let err: PhotoError = std::io::Error::other("disk full").into();
        assert!(matches!(err, PhotoError::SaveFailed(ref msg) if msg.contains("disk full")));
    }

    #[test]
    fn test_hdr_error_display() {
        let err = PhotoError::from(HdrError::DimensionMismatch {
            index: 2,
            width: 10,
            height: 10,
            expected_width: 20,
            expected_height: 10,
        });
        assert_eq!(
            err.to_string(),
            "HDR fusion failed: exposure 2 is 10x10, expected 20x10"
        );
    }
}
