// SPDX-License-Identifier: GPL-3.0-only

//! Photo Finisher - background save pipeline for camera captures
//!
//! Takes encoded captures from a camera and finishes them off the capture
//! path: horizon levelling, mirroring, text stamps, three-exposure HDR
//! fusion, EXIF transplant, DNG output and gallery thumbnails.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`pipelines`]: The save queue and every image-processing stage
//! - [`storage`]: Where finished files go
//! - [`config`]: Saver configuration
//! - [`constants`]: Calibrated numeric constants
//! - [`errors`]: Error types
//! - [`logging`]: Log subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use photo_finisher::{ImageSaver, JpegRequest, SaverConfig};
//!
//! let saver = ImageSaver::with_fs_storage(SaverConfig::default(), None)?;
//! let jpeg = std::fs::read("capture.jpg")?;
//! let mut request = saver.jpeg_request(vec![jpeg], chrono::Local::now());
//! request.mirror = true;
//! saver.enqueue(request.into())?;
//! saver.wait_until_done();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod pipelines;
pub mod storage;

// Re-export commonly used types
pub use config::SaverConfig;
pub use errors::{AppError, AppResult, PhotoError, PhotoResult};
pub use pipelines::photo::{
    FailureKind, GpsFix, HdrProcessor, ImageSaver, JpegRequest, RawRequest, SaveEvent,
    SaveRequest, StampOptions,
};
pub use storage::{FsStorage, MediaKind, StorageHandle, StorageSink};
