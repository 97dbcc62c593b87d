// SPDX-License-Identifier: GPL-3.0-only

//! Gallery thumbnail regeneration

use super::processing;
use crate::constants::thumbnail as k;
use crate::errors::PhotoResult;
use image::RgbImage;
use image::imageops::{self, FilterType};
use tracing::{debug, warn};

/// Power-of-two shrink that brings `full_width` down to about `preview_width`
///
/// `extra_factor` shrinks further, e.g. to keep thumbnails of multi-exposure
/// batches cheap.
pub fn sample_size(full_width: u32, preview_width: u32, extra_factor: u32) -> u32 {
    let ratio = full_width.div_ceil(preview_width.max(1)).max(1);
    ratio
        .checked_next_power_of_two()
        .unwrap_or(u32::MAX)
        .saturating_mul(extra_factor.max(1))
        .max(1)
}

/// Build the thumbnail for a saved image
///
/// Uses the still-resident raster when there is one, otherwise decodes
/// `encoded`. The result is rotated upright using `orientation`.
pub fn regenerate(
    resident: Option<&RgbImage>,
    encoded: &[u8],
    preview_width: u32,
    extra_factor: u32,
    orientation: Option<u32>,
) -> PhotoResult<RgbImage> {
    let thumbnail = match resident {
        Some(raster) => downsample(raster, preview_width, extra_factor),
        None => {
            let decoded = processing::decode(encoded)?;
            downsample(&decoded, preview_width, extra_factor)
        }
    };
    Ok(apply_orientation(thumbnail, orientation))
}

fn downsample(raster: &RgbImage, preview_width: u32, extra_factor: u32) -> RgbImage {
    let (width, height) = raster.dimensions();
    let sample = sample_size(width, preview_width, extra_factor);
    let (thumb_width, thumb_height) = ((width / sample).max(1), (height / sample).max(1));
    debug!(width, height, sample, thumb_width, thumb_height, "Downsampling thumbnail");
    imageops::resize(raster, thumb_width, thumb_height, FilterType::Triangle)
}

/// Rotate according to an EXIF orientation value
///
/// Mirrored orientations are not expected from a camera and are left as is.
pub fn apply_orientation(thumbnail: RgbImage, orientation: Option<u32>) -> RgbImage {
    match orientation {
        Some(k::ORIENTATION_ROTATE_180) => imageops::rotate180(&thumbnail),
        Some(k::ORIENTATION_ROTATE_90) => imageops::rotate90(&thumbnail),
        Some(k::ORIENTATION_ROTATE_270) => imageops::rotate270(&thumbnail),
        None | Some(0) | Some(k::ORIENTATION_NORMAL) => thumbnail,
        Some(other) => {
            warn!(orientation = other, "Unsupported thumbnail orientation, leaving as is");
            thumbnail
        }
    }
}
