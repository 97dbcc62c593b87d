// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the background image saver

use chrono::{DateTime, Local, TimeZone};
use image::{Rgb, RgbImage};
use photo_finisher::pipelines::photo::encoding::{self, CfaPattern, RawCalibration, RawImage};
use photo_finisher::storage::media_file_name;
use photo_finisher::{
    FailureKind, FsStorage, ImageSaver, JpegRequest, MediaKind, PhotoError, RawRequest,
    SaveEvent, SaveRequest, SaverConfig, StorageHandle, StorageSink,
};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

fn jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    encoding::encode_jpeg(&RgbImage::from_pixel(width, height, Rgb(rgb)), 95).unwrap()
}

fn date(second: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 3, 9, 14, 5, second).unwrap()
}

fn config(dir: &Path) -> SaverConfig {
    SaverConfig {
        output_dir: dir.to_path_buf(),
        hdr_threads: Some(2),
        ..Default::default()
    }
}

fn single(second: u32) -> SaveRequest {
    JpegRequest::new(vec![jpeg(32, 24, [90, 90, 90])], date(second)).into()
}

fn drain(rx: &mut UnboundedReceiver<SaveEvent>) -> Vec<SaveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn gated(dir: &Path) -> Arc<GatedStorage> {
    Arc::new(GatedStorage {
        inner: FsStorage::new(dir),
        open: Mutex::new(false),
        opened: Condvar::new(),
        entered: AtomicUsize::new(0),
    })
}

fn wait_for(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(10), "timed out");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Records the order handles are created in
struct RecordingStorage {
    inner: FsStorage,
    created: Mutex<Vec<DateTime<Local>>>,
}

impl StorageSink for RecordingStorage {
    fn create(
        &self,
        kind: MediaKind,
        suffix: &str,
        extension: &str,
        date: &DateTime<Local>,
    ) -> io::Result<StorageHandle> {
        self.created.lock().unwrap().push(*date);
        self.inner.create(kind, suffix, extension, date)
    }

    fn publish(&self, handle: &StorageHandle, is_visible: bool, notify_thumbnail: bool) {
        self.inner.publish(handle, is_visible, notify_thumbnail)
    }
}

/// Holds every `create` until opened
struct GatedStorage {
    inner: FsStorage,
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
}

impl GatedStorage {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl StorageSink for GatedStorage {
    fn create(
        &self,
        kind: MediaKind,
        suffix: &str,
        extension: &str,
        date: &DateTime<Local>,
    ) -> io::Result<StorageHandle> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let open = self.open.lock().unwrap();
        let _open = self.opened.wait_while(open, |open| !*open).unwrap();
        self.inner.create(kind, suffix, extension, date)
    }

    fn publish(&self, handle: &StorageHandle, is_visible: bool, notify_thumbnail: bool) {
        self.inner.publish(handle, is_visible, notify_thumbnail)
    }
}

/// Fails every write for captures taken at `failing_second`
struct FlakyStorage {
    inner: FsStorage,
    failing_second: String,
}

impl StorageSink for FlakyStorage {
    fn create(
        &self,
        kind: MediaKind,
        suffix: &str,
        extension: &str,
        date: &DateTime<Local>,
    ) -> io::Result<StorageHandle> {
        self.inner.create(kind, suffix, extension, date)
    }

    fn write(&self, handle: &StorageHandle, data: &[u8]) -> io::Result<()> {
        if handle.path.to_string_lossy().contains(&self.failing_second) {
            return Err(io::Error::other("disk full"));
        }
        std::fs::write(&handle.path, data)
    }

    fn publish(&self, handle: &StorageHandle, is_visible: bool, notify_thumbnail: bool) {
        self.inner.publish(handle, is_visible, notify_thumbnail)
    }
}

#[test]
fn test_every_request_is_saved() {
    photo_finisher::logging::init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    for second in 0..6 {
        saver.enqueue(single(second)).unwrap();
    }
    saver.wait_until_done();

    assert_eq!(saver.pending(), 0);
    assert_eq!(storage.published().len(), 6);
    assert_eq!(files_in(dir.path()).len(), 6);
}

#[test]
fn test_requests_are_processed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(RecordingStorage {
        inner: FsStorage::new(dir.path()),
        created: Mutex::new(Vec::new()),
    });
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    let seconds = [7, 3, 59, 0, 21];
    for second in seconds {
        saver.enqueue(single(second)).unwrap();
    }
    saver.wait_until_done();

    let created = storage.created.lock().unwrap().clone();
    let expected: Vec<_> = seconds.iter().map(|&s| date(s)).collect();
    assert_eq!(created, expected);
}

#[test]
fn test_full_queue_blocks_producer() {
    let dir = tempfile::tempdir().unwrap();
    let storage = gated(dir.path());
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    // First request is in flight and stuck in the sink
    saver.enqueue(single(1)).unwrap();
    wait_for(|| storage.entered.load(Ordering::SeqCst) == 1);

    // Second request takes the only slot
    saver.enqueue(single(2)).unwrap();

    let third_queued = AtomicBool::new(false);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            saver.enqueue(single(3)).unwrap();
            third_queued.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(200));
        assert!(
            !third_queued.load(Ordering::SeqCst),
            "producer should block while the slot is occupied"
        );
        assert_eq!(saver.pending(), 3);

        storage.open();
    });

    assert!(third_queued.load(Ordering::SeqCst));
    saver.wait_until_done();
    assert_eq!(storage.inner.published().len(), 3);
}

#[test]
fn test_batch_takes_two_queue_slots() {
    let dir = tempfile::tempdir().unwrap();
    let storage = gated(dir.path());
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    let bracket = JpegRequest::new(
        vec![jpeg(32, 24, [40, 40, 40]), jpeg(32, 24, [200, 200, 200])],
        date(5),
    );
    // Returns once the worker has taken the batch and its dummy holds the slot
    saver.enqueue(bracket.into()).unwrap();
    wait_for(|| storage.entered.load(Ordering::SeqCst) == 1);
    assert_eq!(saver.pending(), 2);

    let single_queued = AtomicBool::new(false);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            saver.enqueue(single(6)).unwrap();
            single_queued.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(200));
        assert!(
            !single_queued.load(Ordering::SeqCst),
            "a single capture must wait behind the batch and its dummy"
        );
        assert_eq!(saver.pending(), 3);

        storage.open();
    });

    assert!(single_queued.load(Ordering::SeqCst));
    saver.wait_until_done();
    assert_eq!(saver.pending(), 0);
    assert_eq!(storage.inner.published().len(), 3);
}

#[test]
fn test_storage_failure_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FlakyStorage {
        inner: FsStorage::new(dir.path()),
        failing_second: media_file_name("", "jpg", &date(2), 0),
    });
    let (tx, mut rx) = unbounded_channel();
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), Some(tx)).unwrap();

    for second in 1..=3 {
        saver.enqueue(single(second)).unwrap();
    }
    saver.wait_until_done();

    let events = drain(&mut rx);
    let saved = events
        .iter()
        .filter(|e| matches!(e, SaveEvent::Saved { .. }))
        .count();
    let failures: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SaveEvent::Failed { kind, message } => Some((*kind, message.clone())),
            _ => None,
        })
        .collect();

    assert_eq!(saved, 2);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, FailureKind::Storage);
    assert!(failures[0].1.contains("disk full"));
    assert_eq!(storage.inner.published().len(), 2);
    assert_eq!(
        files_in(dir.path()),
        vec!["IMG_20240309_140501.jpg", "IMG_20240309_140503.jpg"]
    );
}

#[test]
fn test_failed_write_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FlakyStorage {
        inner: FsStorage::new(dir.path()),
        failing_second: media_file_name("", "jpg", &date(1), 0),
    });
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    let err = saver.save_now(single(1)).unwrap_err();
    assert!(matches!(err, PhotoError::SaveFailed(ref msg) if msg.contains("disk full")));

    // Re-encoded output goes through the same path
    let mut mirrored = JpegRequest::new(vec![jpeg(32, 24, [10, 20, 30])], date(1));
    mirrored.mirror = true;
    assert!(saver.save_now(mirrored.into()).is_err());

    assert!(files_in(dir.path()).is_empty());
    assert!(storage.inner.published().is_empty());
    assert_eq!(saver.pending(), 0);
}

#[test]
fn test_hdr_request_saves_exposures_and_fused_image() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let (tx, mut rx) = unbounded_channel();
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), Some(tx)).unwrap();

    let mut request = JpegRequest::hdr(
        [
            jpeg(64, 48, [40, 40, 40]),
            jpeg(64, 48, [110, 110, 110]),
            jpeg(64, 48, [220, 220, 220]),
        ],
        date(0),
    );
    request.save_exposures = true;
    saver.enqueue(request.into()).unwrap();
    saver.wait_until_done();
    assert_eq!(saver.pending(), 0);

    let files = files_in(dir.path());
    assert_eq!(
        files,
        vec![
            "IMG_20240309_140500_EXP0.jpg",
            "IMG_20240309_140500_EXP1.jpg",
            "IMG_20240309_140500_EXP2.jpg",
            "IMG_20240309_140500_HDR.jpg",
        ]
    );

    let events = drain(&mut rx);
    let shared: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SaveEvent::Saved { path, share: true } => Some(path.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(shared.len(), 1);
    assert!(shared[0].to_string_lossy().ends_with("_HDR.jpg"));

    let thumbnails = events
        .iter()
        .filter(|e| matches!(e, SaveEvent::ThumbnailReady(_)))
        .count();
    assert_eq!(thumbnails, 1, "only the fused image refreshes the thumbnail");

    let fused = image::open(dir.path().join("IMG_20240309_140500_HDR.jpg")).unwrap();
    assert_eq!((fused.width(), fused.height()), (64, 48));
}

#[test]
fn test_exposure_batch_shares_middle_image() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let (tx, mut rx) = unbounded_channel();
    let saver = ImageSaver::new(config(dir.path()), storage, Some(tx)).unwrap();

    let mut request = JpegRequest::new(
        vec![
            jpeg(32, 24, [30, 30, 30]),
            jpeg(32, 24, [120, 120, 120]),
            jpeg(32, 24, [230, 230, 230]),
        ],
        date(4),
    );
    request.thumbnail_sample_factor = 2;
    saver.enqueue(request.into()).unwrap();
    saver.wait_until_done();

    let saved: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SaveEvent::Saved { path, share } => Some((path, share)),
            _ => None,
        })
        .collect();
    assert_eq!(saved.len(), 3);
    let shared: Vec<_> = saved.iter().filter(|(_, share)| *share).collect();
    assert_eq!(shared.len(), 1);
    assert!(shared[0].0.to_string_lossy().ends_with("_EXP1.jpg"));
}

#[test]
fn test_untouched_image_is_written_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    let original = jpeg(40, 30, [12, 200, 90]);
    saver
        .save_now(JpegRequest::new(vec![original.clone()], date(8)).into())
        .unwrap();

    let path = storage.last_published().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), original);
}

#[test]
fn test_mirror_reencodes_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    let source = RgbImage::from_fn(64, 32, |x, _| {
        if x < 32 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }
    });
    let mut request = JpegRequest::new(vec![encoding::encode_jpeg(&source, 95).unwrap()], date(9));
    request.mirror = true;
    saver.save_now(request.into()).unwrap();

    let saved = image::open(storage.last_published().unwrap()).unwrap().to_rgb8();
    assert_eq!(saved.dimensions(), (64, 32));
    let left = saved.get_pixel(4, 16);
    assert!(left[2] > 200 && left[0] < 60, "left edge should now be blue: {:?}", left);
}

#[test]
fn test_decode_failure_reports_and_keeps_original() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let (tx, mut rx) = unbounded_channel();
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), Some(tx)).unwrap();

    let mut request = JpegRequest::new(vec![b"not a jpeg".to_vec()], date(10));
    request.stamp.text = "hello".to_string();
    saver.save_now(request.into()).unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SaveEvent::Failed {
            kind: FailureKind::Stamp,
            ..
        }
    )));
    let path = storage.last_published().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"not a jpeg");
}

#[test]
fn test_invalid_requests_do_not_stop_worker() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    let empty = JpegRequest::new(Vec::new(), date(0));
    assert!(matches!(
        saver.save_now(empty.clone().into()),
        Err(PhotoError::InvalidRequest(_))
    ));

    let mut short_hdr = JpegRequest::new(vec![jpeg(8, 8, [1, 1, 1]); 2], date(0));
    short_hdr.is_hdr = true;
    assert!(matches!(
        saver.save_now(short_hdr.into()),
        Err(PhotoError::InvalidRequest(_))
    ));

    saver.enqueue(empty.into()).unwrap();
    saver.enqueue(single(11)).unwrap();
    saver.wait_until_done();
    assert_eq!(storage.published().len(), 1);
}

#[test]
fn test_raw_request_writes_dng() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    let request = RawRequest {
        image: RawImage {
            width: 8,
            height: 8,
            data: (0..64).map(|v| v * 512).collect(),
            cfa: CfaPattern::Rggb,
        },
        calibration: RawCalibration {
            black_level: 64,
            white_level: 1023,
            make: Some("Acme".to_string()),
            model: Some("Sensor 1".to_string()),
            ..Default::default()
        },
        date: date(12),
    };
    saver.enqueue(request.into()).unwrap();
    saver.wait_until_done();

    assert_eq!(files_in(dir.path()), vec!["IMG_20240309_140512.dng"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_enqueue_from_async_code() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    let (tx, mut rx) = unbounded_channel();
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), Some(tx)).unwrap();

    saver.enqueue_async(single(20)).await.unwrap();
    saver.enqueue_async(single(21)).await.unwrap();

    let mut saved = 0;
    while saved < 2 {
        if let Some(SaveEvent::Saved { .. }) = rx.recv().await {
            saved += 1;
        }
    }
    assert_eq!(storage.published().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_async_enqueue_is_not_counted() {
    let dir = tempfile::tempdir().unwrap();
    let storage = gated(dir.path());
    let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();

    saver.enqueue_async(single(40)).await.unwrap();
    while storage.entered.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    saver.enqueue_async(single(41)).await.unwrap();

    let third = tokio::time::timeout(Duration::from_millis(100), saver.enqueue_async(single(42)));
    assert!(third.await.is_err(), "queue is full, enqueue should still be waiting");
    assert_eq!(saver.pending(), 2);

    storage.open();
    tokio::task::block_in_place(|| saver.wait_until_done());
    assert_eq!(saver.pending(), 0);
    assert_eq!(storage.inner.published().len(), 2);
}

#[test]
fn test_drop_finishes_accepted_requests() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    {
        let saver = ImageSaver::new(config(dir.path()), storage.clone(), None).unwrap();
        saver.enqueue(single(30)).unwrap();
        saver.enqueue(single(31)).unwrap();
    }
    assert_eq!(storage.published().len(), 2);
}
