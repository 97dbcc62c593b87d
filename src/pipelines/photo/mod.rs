// SPDX-License-Identifier: GPL-3.0-only

//! Photo finishing pipeline
//!
//! ```text
//! enqueue → worker → decode → stabilise → mirror → stamp
//!                      ↓                              ↓
//!                 HDR fusion ───────────────────▶ encode → EXIF → storage
//!                                                                  ↓
//!                                                             thumbnail
//! ```
//!
//! # Pipeline Stages
//!
//! 1. **Queue**: [`saver`] accepts requests and finishes them in order
//! 2. **Transform**: [`processing`] levels, mirrors and [`stamp`] overlays
//! 3. **Fusion**: [`hdr`] merges dark/base/bright exposures
//! 4. **Encoding**: [`encoding`] writes JPEG or DNG
//! 5. **Metadata**: [`metadata`] carries EXIF over to the new file
//! 6. **Thumbnail**: [`thumbnail`] renders the gallery preview

pub mod encoding;
pub mod hdr;
pub mod metadata;
pub mod processing;
pub mod request;
pub mod saver;
pub mod stamp;
pub mod thumbnail;

pub use encoding::{CfaPattern, RawCalibration, RawImage};
pub use hdr::HdrProcessor;
pub use metadata::{MetadataPatch, TagSet};
pub use request::{GpsFix, JpegRequest, RawRequest, SaveRequest};
pub use saver::{EventSender, FailureKind, ImageSaver, SaveEvent};
pub use stamp::{DateFormat, GpsFormat, StampOptions, StampStyle, TimeFormat};
