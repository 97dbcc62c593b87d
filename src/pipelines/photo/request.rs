// SPDX-License-Identifier: GPL-3.0-only

//! Save requests
//!
//! A request is built when a capture completes, travels through the save
//! queue exactly once and is dropped by the worker when it finishes, which
//! releases every buffer it carried.

use super::encoding::{RawCalibration, RawImage};
use super::stamp::StampOptions;
use crate::constants::{encoding, queue};
use chrono::{DateTime, Local};

/// GPS fix recorded with a capture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level, if the fix has altitude
    pub altitude: Option<f64>,
}

/// One or more encoded captures plus everything needed to finish them
#[derive(Debug, Clone)]
pub struct JpegRequest {
    /// Encoded images; for HDR ordered dark, base, bright
    pub images: Vec<Vec<u8>>,
    /// Fuse the three exposures into one image
    pub is_hdr: bool,
    /// Also keep the individual exposures of an HDR capture
    pub save_exposures: bool,
    /// JPEG quality for re-encoded output (1-100)
    pub quality: u8,
    /// Level the horizon by `level_angle` degrees
    pub auto_stabilise: bool,
    pub level_angle: f64,
    pub is_front_facing: bool,
    /// Flip horizontally
    pub mirror: bool,
    /// Capture time
    pub date: DateTime<Local>,
    pub stamp: StampOptions,
    pub location: Option<GpsFix>,
    /// Compass heading in degrees; also written as GPSImgDirection
    pub heading: Option<f64>,
    /// Rewrite GPS date/time tags from `date`
    pub fix_gps_timestamp: bool,
    /// Extra thumbnail shrink (e.g. 2 for multi-exposure batches)
    pub thumbnail_sample_factor: u32,
}

impl JpegRequest {
    /// Single capture with no post-processing
    pub fn new(images: Vec<Vec<u8>>, date: DateTime<Local>) -> Self {
        Self {
            images,
            is_hdr: false,
            save_exposures: false,
            quality: encoding::DEFAULT_JPEG_QUALITY,
            auto_stabilise: false,
            level_angle: 0.0,
            is_front_facing: false,
            mirror: false,
            date,
            stamp: StampOptions::default(),
            location: None,
            heading: None,
            fix_gps_timestamp: false,
            thumbnail_sample_factor: 1,
        }
    }

    /// Three exposures (dark, base, bright) to be fused
    pub fn hdr(exposures: [Vec<u8>; 3], date: DateTime<Local>) -> Self {
        Self {
            is_hdr: true,
            ..Self::new(exposures.into(), date)
        }
    }
}

/// Raw sensor capture to be written as DNG
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub image: RawImage,
    pub calibration: RawCalibration,
    pub date: DateTime<Local>,
}

/// Unit of work for the save queue
#[derive(Debug, Clone)]
pub enum SaveRequest {
    Jpeg(JpegRequest),
    Raw(RawRequest),
    /// Occupies a queue slot without payload so memory-heavy batches
    /// count twice against the queue capacity
    Dummy,
}

impl SaveRequest {
    /// Queue cost units this request accounts for, including its paired dummy
    pub fn cost(&self) -> usize {
        if self.needs_cost_pairing() {
            queue::BATCH_COST
        } else {
            queue::SINGLE_COST
        }
    }

    /// HDR and multi-exposure batches are followed by a dummy request
    pub fn needs_cost_pairing(&self) -> bool {
        match self {
            SaveRequest::Jpeg(request) => request.is_hdr || request.images.len() > 1,
            SaveRequest::Raw(_) | SaveRequest::Dummy => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SaveRequest::Jpeg(_) => "jpeg",
            SaveRequest::Raw(_) => "raw",
            SaveRequest::Dummy => "dummy",
        }
    }
}

impl From<JpegRequest> for SaveRequest {
    fn from(request: JpegRequest) -> Self {
        SaveRequest::Jpeg(request)
    }
}

impl From<RawRequest> for SaveRequest {
    fn from(request: RawRequest) -> Self {
        SaveRequest::Raw(request)
    }
}
