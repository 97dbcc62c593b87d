// SPDX-License-Identifier: GPL-3.0-only

//! Output encoders
//!
//! Processed rasters are written as JPEG; raw sensor captures are written as
//! DNG with the CFA layout and calibration a raw developer needs.

use crate::errors::{PhotoError, PhotoResult};
use image::RgbImage;
use tracing::debug;

/// Encode image as JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> PhotoResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);

    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100));

    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| PhotoError::EncodingFailed(format!("JPEG: {}", e)))?;

    debug!(
        width = image.width(),
        height = image.height(),
        quality,
        bytes = buffer.len(),
        "Encoded JPEG"
    );
    Ok(buffer)
}

/// Colour filter array arrangement of a 2x2 Bayer tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfaPattern {
    #[default]
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

impl CfaPattern {
    /// DNG CFAPattern values (0 = red, 1 = green, 2 = blue) in row order
    pub fn dng_values(&self) -> [u8; 4] {
        match self {
            CfaPattern::Rggb => [0, 1, 1, 2],
            CfaPattern::Bggr => [2, 1, 1, 0],
            CfaPattern::Grbg => [1, 0, 2, 1],
            CfaPattern::Gbrg => [1, 2, 0, 1],
        }
    }
}

/// Single-plane sensor readout, one 16-bit sample per photosite
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
    pub cfa: CfaPattern,
}

impl RawImage {
    pub fn validate(&self) -> PhotoResult<()> {
        let expected = self.width as usize * self.height as usize;
        if self.width == 0 || self.height == 0 || self.data.len() != expected {
            return Err(PhotoError::InvalidRequest(format!(
                "raw image {}x{} carries {} samples",
                self.width,
                self.height,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Per-capture sensor calibration
#[derive(Debug, Clone, PartialEq)]
pub struct RawCalibration {
    pub black_level: u16,
    pub white_level: u16,
    /// XYZ to camera, row major
    pub color_matrix: [f64; 9],
    pub make: Option<String>,
    pub model: Option<String>,
}

impl Default for RawCalibration {
    fn default() -> Self {
        Self {
            black_level: 0,
            white_level: u16::MAX,
            color_matrix: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            make: None,
            model: None,
        }
    }
}

/// Encode a CFA capture as DNG
///
/// The samples are stored uncompressed in a single strip, little endian.
pub fn encode_dng(raw: &RawImage, calibration: &RawCalibration) -> PhotoResult<Vec<u8>> {
    use dng::ifd::{Ifd, IfdValue, Offsets};
    use dng::tags::ifd as tiff_tags;
    use dng::{DngWriter, FileType};
    use std::io::{Cursor, Write};
    use std::sync::Arc;

    raw.validate()?;
    let (width, height) = (raw.width, raw.height);

    let strip: Vec<u8> = raw.data.iter().flat_map(|s| s.to_le_bytes()).collect();
    let strip_len = strip.len() as u32;

    let mut ifd = Ifd::default();

    ifd.insert(tiff_tags::NewSubfileType, IfdValue::Long(0));
    ifd.insert(tiff_tags::ImageWidth, IfdValue::Long(width));
    ifd.insert(tiff_tags::ImageLength, IfdValue::Long(height));
    ifd.insert(tiff_tags::BitsPerSample, IfdValue::Short(16));
    ifd.insert(tiff_tags::Compression, IfdValue::Short(1)); // No compression
    ifd.insert(tiff_tags::PhotometricInterpretation, IfdValue::Short(32803)); // CFA
    ifd.insert(tiff_tags::SamplesPerPixel, IfdValue::Short(1));
    ifd.insert(tiff_tags::RowsPerStrip, IfdValue::Long(height)); // One strip
    ifd.insert(tiff_tags::PlanarConfiguration, IfdValue::Short(1));

    ifd.insert(
        tiff_tags::CFARepeatPatternDim,
        IfdValue::List(vec![IfdValue::Short(2), IfdValue::Short(2)]),
    );
    ifd.insert(
        tiff_tags::CFAPattern,
        IfdValue::List(
            raw.cfa
                .dng_values()
                .iter()
                .map(|&v| IfdValue::Byte(v))
                .collect(),
        ),
    );

    ifd.insert(
        tiff_tags::DNGVersion,
        IfdValue::List(vec![
            IfdValue::Byte(1),
            IfdValue::Byte(4),
            IfdValue::Byte(0),
            IfdValue::Byte(0),
        ]),
    );
    ifd.insert(tiff_tags::BlackLevel, IfdValue::Short(calibration.black_level));
    ifd.insert(tiff_tags::WhiteLevel, IfdValue::Short(calibration.white_level));
    ifd.insert(
        tiff_tags::ColorMatrix1,
        IfdValue::List(
            calibration
                .color_matrix
                .iter()
                .map(|&v| {
                    let (num, denom) = to_srational(v);
                    IfdValue::SRational(num, denom)
                })
                .collect(),
        ),
    );

    ifd.insert(
        tiff_tags::Software,
        IfdValue::Ascii(format!("photo-finisher {}", env!("GIT_VERSION"))),
    );

    let make = calibration.make.clone().unwrap_or_default();
    let model = calibration.model.clone().unwrap_or_default();
    if !make.is_empty() {
        ifd.insert(tiff_tags::Make, IfdValue::Ascii(make.clone()));
    }
    if !model.is_empty() {
        ifd.insert(tiff_tags::Model, IfdValue::Ascii(model.clone()));
    }
    let unique_model = format!("{} {}", make, model).trim().to_string();
    ifd.insert(
        tiff_tags::UniqueCameraModel,
        IfdValue::Ascii(if unique_model.is_empty() {
            "Unknown".to_string()
        } else {
            unique_model
        }),
    );

    struct SampleStrip {
        data: Vec<u8>,
    }

    impl Offsets for SampleStrip {
        fn size(&self) -> u32 {
            self.data.len() as u32
        }

        fn write(&self, writer: &mut dyn Write) -> std::io::Result<()> {
            writer.write_all(&self.data)
        }
    }

    let offsets: Arc<dyn Offsets + Send + Sync> = Arc::new(SampleStrip { data: strip });
    ifd.insert(tiff_tags::StripOffsets, IfdValue::Offsets(offsets));
    ifd.insert(tiff_tags::StripByteCounts, IfdValue::Long(strip_len));

    let mut buffer = Vec::new();
    let cursor = Cursor::new(&mut buffer);

    DngWriter::write_dng(cursor, true, FileType::Dng, vec![ifd])
        .map_err(|e| PhotoError::EncodingFailed(format!("DNG: {:?}", e)))?;

    debug!(width, height, bytes = buffer.len(), "Encoded DNG");
    Ok(buffer)
}

/// Signed rational with 1/10000 precision, reduced
fn to_srational(value: f64) -> (i32, i32) {
    const DENOM: u32 = 10_000;
    let numerator = (value * DENOM as f64).round() as i32;
    let divisor = gcd(numerator.unsigned_abs(), DENOM) as i32;
    (numerator / divisor, DENOM as i32 / divisor)
}

/// Calculate greatest common divisor using Euclidean algorithm
fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1) // Avoid division by zero
}
