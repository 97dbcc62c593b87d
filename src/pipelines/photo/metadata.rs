// SPDX-License-Identifier: GPL-3.0-only

//! EXIF transplant
//!
//! Re-encoding a transformed raster drops every tag of the original capture.
//! The tags are read back from the original encoded bytes, corrected where
//! the caller asks for it and embedded into the new JPEG. Dimension tags are
//! left out since they describe the old raster.

use crate::constants::encoding;
use crate::errors::MetadataError;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Timelike, Utc};
use exif::{Field, In, Rational, Tag, Value};
use img_parts::ImageEXIF;
use img_parts::jpeg::Jpeg;
use std::io::{BufReader, Cursor, Seek, SeekFrom, Write};
use tracing::{debug, warn};

/// Tags that only make sense inside the IFD layout they were read from
const STRUCTURAL_TAGS: [Tag; 5] = [
    Tag::ExifIFDPointer,
    Tag::GPSInfoIFDPointer,
    Tag::InteropIFDPointer,
    Tag::JPEGInterchangeFormat,
    Tag::JPEGInterchangeFormatLength,
];

/// Tags describing the size of the raster they were read with
const DIMENSION_TAGS: [Tag; 4] = [
    Tag::ImageWidth,
    Tag::ImageLength,
    Tag::PixelXDimension,
    Tag::PixelYDimension,
];

/// Primary-image tags of one capture, in file order
#[derive(Debug, Clone)]
pub struct TagSet {
    fields: Vec<Field>,
    little_endian: bool,
}

impl Default for TagSet {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            little_endian: true,
        }
    }
}

impl TagSet {
    pub fn from_fields(fields: impl IntoIterator<Item = Field>) -> Self {
        let mut set = Self::default();
        for field in fields {
            set.set(field);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn get(&self, tag: Tag) -> Option<&Field> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    /// Insert or replace the field with the same tag
    pub fn set(&mut self, field: Field) {
        match self.fields.iter_mut().find(|f| f.tag == field.tag) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    pub fn remove(&mut self, tag: Tag) {
        self.fields.retain(|f| f.tag != tag);
    }

    /// EXIF orientation (1-8), if tagged
    pub fn orientation(&self) -> Option<u32> {
        self.get(Tag::Orientation)
            .and_then(|f| f.value.get_uint(0))
    }

    /// Copy with width/height tags removed
    pub fn without_dimensions(&self) -> TagSet {
        TagSet {
            fields: self
                .fields
                .iter()
                .filter(|f| !DIMENSION_TAGS.contains(&f.tag))
                .cloned()
                .collect(),
            little_endian: self.little_endian,
        }
    }

    /// Apply the corrective writes in `patch`
    ///
    /// `DateTime` is also copied to the original/digitized variants so all
    /// three agree.
    pub fn apply(&mut self, patch: &MetadataPatch) {
        if let Some(datetime) = self.get(Tag::DateTime).map(|f| f.value.clone()) {
            self.set(primary(Tag::DateTimeOriginal, datetime.clone()));
            self.set(primary(Tag::DateTimeDigitized, datetime));
        }

        if let Some(heading) = patch.heading {
            let (num, denom) = heading_rational(heading);
            debug!(heading, num, denom, "Writing GPS image direction");
            self.set(primary(
                Tag::GPSImgDirection,
                Value::Rational(vec![Rational { num, denom }]),
            ));
            self.set(primary(
                Tag::GPSImgDirectionRef,
                Value::Ascii(vec![encoding::GPS_DIRECTION_REF.as_bytes().to_vec()]),
            ));
        }

        if let Some(timestamp) = patch.gps_timestamp {
            debug!(%timestamp, "Rewriting GPS timestamp");
            self.set(primary(
                Tag::GPSDateStamp,
                Value::Ascii(vec![gps_date_stamp(&timestamp).into_bytes()]),
            ));
            self.set(primary(
                Tag::GPSTimeStamp,
                Value::Rational(vec![
                    Rational { num: timestamp.hour(), denom: 1 },
                    Rational { num: timestamp.minute(), denom: 1 },
                    Rational { num: timestamp.second(), denom: 1 },
                ]),
            ));
        }
    }

    /// Serialise as a TIFF structure suitable for an APP1 segment
    pub fn to_tiff(&self) -> Result<Vec<u8>, MetadataError> {
        let mut writer = exif::experimental::Writer::new();
        for field in &self.fields {
            writer.push_field(field);
        }
        let mut out = Cursor::new(Vec::new());
        writer
            .write(&mut out, self.little_endian)
            .map_err(|e| MetadataError::Write(e.to_string()))?;
        Ok(out.into_inner())
    }

    /// Copy of `jpeg` with its EXIF segment replaced by this tag set
    pub fn embed(&self, jpeg: &[u8]) -> Result<Vec<u8>, MetadataError> {
        if self.is_empty() {
            return Ok(jpeg.to_vec());
        }
        let tiff = self.to_tiff()?;
        let mut image = Jpeg::from_bytes(Bytes::copy_from_slice(jpeg))
            .map_err(|e| MetadataError::Write(e.to_string()))?;
        image.set_exif(Some(Bytes::from(tiff)));

        let mut out = Vec::new();
        image
            .encoder()
            .write_to(&mut out)
            .map_err(|e| MetadataError::Write(e.to_string()))?;
        Ok(out)
    }
}

/// Corrections written on top of the transplanted tags
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetadataPatch {
    /// Compass heading in degrees
    pub heading: Option<f64>,
    /// True capture time for the GPS date/time tags
    pub gps_timestamp: Option<DateTime<Utc>>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.heading.is_none() && self.gps_timestamp.is_none()
    }
}

fn primary(tag: Tag, value: Value) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value,
    }
}

/// Degrees in [0, 360) as a rational with two decimals
pub fn heading_rational(degrees: f64) -> (u32, u32) {
    let degrees = if degrees < 0.0 { degrees + 360.0 } else { degrees };
    let denom = encoding::GPS_DIRECTION_DENOM;
    let num = (degrees * denom as f64).round().max(0.0) as u32;
    (num, denom)
}

/// Read the primary-image tags of an encoded image
///
/// The bytes are copied to a temporary file and parsed from there. An image
/// without EXIF data yields an empty tag set.
pub fn read_tags(encoded: &[u8]) -> Result<TagSet, MetadataError> {
    let mut file = tempfile::tempfile()?;
    file.write_all(encoded)?;
    file.seek(SeekFrom::Start(0))?;

    let exif = match exif::Reader::new().read_from_container(&mut BufReader::new(file)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => {
            debug!("No EXIF data in source image");
            return Ok(TagSet::default());
        }
        Err(e) => return Err(MetadataError::Read(e.to_string())),
    };

    let mut skipped = 0usize;
    let fields = exif
        .fields()
        .filter(|f| {
            let keep = f.ifd_num == In::PRIMARY
                && !STRUCTURAL_TAGS.contains(&f.tag)
                && !matches!(f.value, Value::Unknown(..));
            if !keep {
                skipped += 1;
            }
            keep
        })
        .cloned()
        .collect::<Vec<_>>();
    if skipped > 0 {
        debug!(skipped, "Skipped structural or unreadable tags");
    }

    let mut set = TagSet::from_fields(fields);
    set.little_endian = exif.little_endian();
    debug!(tags = set.len(), orientation = ?set.orientation(), "Read source tags");
    Ok(set)
}

/// Move `source` tags into a freshly encoded JPEG
pub fn transplant(
    source: &TagSet,
    encoded: &[u8],
    patch: &MetadataPatch,
) -> Result<Vec<u8>, MetadataError> {
    let mut tags = source.without_dimensions();
    tags.apply(patch);
    tags.embed(encoded)
}

/// Apply `patch` to an image whose pixels were not touched
pub fn patch_in_place(
    original: &[u8],
    source: &TagSet,
    patch: &MetadataPatch,
) -> Result<Vec<u8>, MetadataError> {
    let mut tags = source.clone();
    tags.apply(patch);
    tags.embed(original)
}

pub(crate) fn log_failure(stage: &str, err: &MetadataError) {
    warn!(stage, error = %err, "Metadata step failed, keeping image without it");
}

/// Day of the capture in UTC, as written to GPSDateStamp
pub fn gps_date_stamp(timestamp: &DateTime<Utc>) -> String {
    format!(
        "{:04}:{:02}:{:02}",
        timestamp.year(),
        timestamp.month(),
        timestamp.day()
    )
}
