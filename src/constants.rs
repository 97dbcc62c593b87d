// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants
//!
//! The numeric values here are calibrated against each other (the HDR
//! weights, the tonemap key and the stamp metrics), so change them together.

/// Save queue sizing
pub mod queue {
    /// Slots ahead of the request in flight. With one slot, at most two
    /// requests exist at once: the one being processed and one waiting.
    pub const DEFAULT_CAPACITY: usize = 1;

    /// Cost units consumed by a plain single-image save
    pub const SINGLE_COST: usize = 1;

    /// Cost units consumed by HDR and multi-exposure batches (request + dummy)
    pub const BATCH_COST: usize = 2;

    /// Name of the saver worker thread
    pub const WORKER_NAME: &str = "image-saver";
}

/// HDR fusion constants
pub mod hdr {
    /// Number of exposures merged (dark, base, bright)
    pub const EXPOSURE_COUNT: usize = 3;

    /// Index of the reference exposure
    pub const BASE_EXPOSURE: usize = 1;

    /// Samples per axis of the calibration grid (10x10 = 100 samples)
    pub const SAMPLE_GRID: u32 = 10;

    /// Below this the least-squares denominator is treated as degenerate
    pub const RESPONSE_DENOM_EPSILON: f64 = 1.0e-5;

    /// Mid-grey the per-pixel weights peak at
    pub const WEIGHT_CENTER: f32 = 127.5;

    /// Chosen so that 0 and 255 map to a non-zero weight of 1/127.5
    pub const WEIGHT_SCALE: f32 = ((1.0 - 1.0 / 127.5) / 127.5) as f32;

    /// Luminance coefficients
    pub const LUMA_R: f64 = 0.27;
    pub const LUMA_G: f64 = 0.67;
    pub const LUMA_B: f64 = 0.06;

    /// Reinhard key: the log-average luminance maps to this fraction
    pub const TONEMAP_KEY: f32 = 0.5;
}

/// Photo stamp metrics, in points (1pt = 1/72")
pub mod stamp {
    /// Points per inch
    pub const POINTS_PER_INCH: f32 = 72.0;

    /// Nominal physical size of the image's shorter side
    pub const NOMINAL_INCHES: f32 = 4.0;

    /// Distance of the text from the right and bottom edges
    pub const EDGE_OFFSET_PT: f32 = 8.0;

    /// Extra spacing between stacked lines
    pub const LINE_GAP_PT: f32 = 4.0;

    /// Default font size
    pub const DEFAULT_FONT_SIZE_PT: u32 = 12;

    /// Glyph cell size of the bitmap font
    pub const GLYPH_CELLS: u32 = 8;

    /// Opacity of the backing rectangle in plain style
    pub const BACKGROUND_ALPHA: f32 = 0.25;
}

/// Thumbnail constants
pub mod thumbnail {
    /// Default on-screen width the thumbnail is sized against
    pub const DEFAULT_PREVIEW_WIDTH: u32 = 1280;

    /// EXIF orientation values
    pub const ORIENTATION_NORMAL: u32 = 1;
    pub const ORIENTATION_ROTATE_180: u32 = 3;
    pub const ORIENTATION_ROTATE_90: u32 = 6;
    pub const ORIENTATION_ROTATE_270: u32 = 8;
}

/// Output file naming
pub mod naming {
    /// Prefix of every saved image
    pub const IMAGE_PREFIX: &str = "IMG_";

    /// Timestamp layout used in file names
    pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

    /// Suffix of the fused HDR image
    pub const HDR_SUFFIX: &str = "_HDR";

    /// Suffix of an individual exposure
    pub fn exposure_suffix(index: usize) -> String {
        format!("_EXP{}", index)
    }

    /// JPEG extension
    pub const JPEG_EXTENSION: &str = "jpg";

    /// DNG extension
    pub const DNG_EXTENSION: &str = "dng";
}

/// Encoding defaults
pub mod encoding {
    /// Default JPEG quality (1-100)
    pub const DEFAULT_JPEG_QUALITY: u8 = 90;

    /// Reference character written alongside GPSImgDirection (magnetic north)
    pub const GPS_DIRECTION_REF: &str = "M";

    /// Denominator of the GPSImgDirection rational
    pub const GPS_DIRECTION_DENOM: u32 = 100;
}

/// Number of worker threads for CPU-bound passes
pub fn worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4) // Fallback to 4 if detection fails
}
