// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the EXIF transplant

use chrono::{Local, TimeZone, Utc};
use exif::{Field, In, Rational, Tag, Value};
use image::{Rgb, RgbImage};
use photo_finisher::pipelines::photo::encoding::encode_jpeg;
use photo_finisher::pipelines::photo::metadata::{
    MetadataPatch, TagSet, patch_in_place, read_tags, transplant,
};
use photo_finisher::{FsStorage, GpsFix, ImageSaver, JpegRequest, SaveEvent, SaverConfig};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;

fn field(tag: Tag, value: Value) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value,
    }
}

fn ascii(text: &str) -> Value {
    Value::Ascii(vec![text.as_bytes().to_vec()])
}

fn text_of(tags: &TagSet, tag: Tag) -> Option<String> {
    match &tags.get(tag)?.value {
        Value::Ascii(parts) => parts
            .first()
            .map(|p| String::from_utf8_lossy(p).into_owned()),
        _ => None,
    }
}

/// 64x48 capture tagged the way a phone camera would
fn tagged_capture() -> Vec<u8> {
    let pixels = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
    let jpeg = encode_jpeg(&pixels, 92).unwrap();
    let tags = TagSet::from_fields([
        field(Tag::Make, ascii("Acme")),
        field(Tag::Model, ascii("Pocket 3")),
        field(Tag::Orientation, Value::Short(vec![6])),
        field(Tag::DateTime, ascii("2024:03:09 14:05:07")),
        field(Tag::PhotographicSensitivity, Value::Short(vec![200])),
        field(Tag::PixelXDimension, Value::Long(vec![64])),
        field(Tag::PixelYDimension, Value::Long(vec![48])),
        field(
            Tag::FocalLength,
            Value::Rational(vec![Rational { num: 47, denom: 10 }]),
        ),
    ]);
    tags.embed(&jpeg).unwrap()
}

#[test]
fn test_read_tags_from_capture() {
    let tags = read_tags(&tagged_capture()).unwrap();
    assert_eq!(text_of(&tags, Tag::Make).as_deref(), Some("Acme"));
    assert_eq!(tags.orientation(), Some(6));
    assert!(tags.get(Tag::PixelXDimension).is_some());
    assert!(tags.get(Tag::ExifIFDPointer).is_none());
}

#[test]
fn test_transplant_drops_dimensions_and_keeps_the_rest() {
    let source = read_tags(&tagged_capture()).unwrap();
    let reencoded = encode_jpeg(&RgbImage::new(30, 20), 80).unwrap();

    let output = transplant(&source, &reencoded, &MetadataPatch::default()).unwrap();
    let tags = read_tags(&output).unwrap();

    assert_eq!(text_of(&tags, Tag::Model).as_deref(), Some("Pocket 3"));
    assert_eq!(tags.orientation(), Some(6));
    assert!(tags.get(Tag::PixelXDimension).is_none());
    assert!(tags.get(Tag::PixelYDimension).is_none());
    assert!(tags.get(Tag::FocalLength).is_some());
    assert_eq!(
        text_of(&tags, Tag::DateTimeOriginal).as_deref(),
        Some("2024:03:09 14:05:07")
    );
    assert_eq!(
        text_of(&tags, Tag::DateTimeDigitized).as_deref(),
        Some("2024:03:09 14:05:07")
    );

    let decoded = image::load_from_memory(&output).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (30, 20));
}

#[test]
fn test_patch_in_place_adds_heading() {
    let original = tagged_capture();
    let source = read_tags(&original).unwrap();
    let patch = MetadataPatch {
        heading: Some(-90.0),
        gps_timestamp: None,
    };

    let output = patch_in_place(&original, &source, &patch).unwrap();
    let tags = read_tags(&output).unwrap();

    match &tags.get(Tag::GPSImgDirection).unwrap().value {
        Value::Rational(values) => {
            assert_eq!((values[0].num, values[0].denom), (27000, 100));
        }
        other => panic!("unexpected value {:?}", other),
    }
    assert_eq!(text_of(&tags, Tag::GPSImgDirectionRef).as_deref(), Some("M"));
    // Untouched pixels keep their dimension tags
    assert!(tags.get(Tag::PixelXDimension).is_some());
}

#[test]
fn test_saver_transplants_and_rotates_thumbnail() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let (tx, mut rx) = unbounded_channel();
    let config = SaverConfig {
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let saver = ImageSaver::new(config, storage.clone(), Some(tx)).unwrap();

    let date = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
    let mut request = JpegRequest::new(vec![tagged_capture()], date);
    request.mirror = true;
    saver.save_now(request.into()).unwrap();

    let saved = std::fs::read(storage.last_published().unwrap()).unwrap();
    let tags = read_tags(&saved).unwrap();
    assert_eq!(text_of(&tags, Tag::Make).as_deref(), Some("Acme"));
    assert!(tags.get(Tag::PixelXDimension).is_none());

    let mut thumbnail = None;
    while let Ok(event) = rx.try_recv() {
        if let SaveEvent::ThumbnailReady(image) = event {
            thumbnail = Some(image);
        }
    }
    // Orientation 6 turns the landscape raster upright
    assert_eq!(thumbnail.unwrap().dimensions(), (48, 64));
}

#[test]
fn test_saver_rewrites_gps_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let config = SaverConfig {
        output_dir: dir.path().to_path_buf(),
        fix_gps_timestamp: true,
        ..Default::default()
    };
    let saver = ImageSaver::new(config, storage.clone(), None).unwrap();

    let date = Utc
        .with_ymd_and_hms(2024, 3, 9, 23, 30, 15)
        .unwrap()
        .with_timezone(&Local);
    let mut request = saver.jpeg_request(vec![tagged_capture()], date);
    request.location = Some(GpsFix {
        latitude: 48.85,
        longitude: 2.35,
        altitude: None,
    });
    saver.save_now(request.into()).unwrap();

    let saved = std::fs::read(storage.last_published().unwrap()).unwrap();
    let tags = read_tags(&saved).unwrap();
    assert_eq!(text_of(&tags, Tag::GPSDateStamp).as_deref(), Some("2024:03:09"));
    match &tags.get(Tag::GPSTimeStamp).unwrap().value {
        Value::Rational(hms) => {
            let parts: Vec<u32> = hms.iter().map(|r| r.num / r.denom).collect();
            assert_eq!(parts, vec![23, 30, 15]);
        }
        other => panic!("unexpected value {:?}", other),
    }
}
