// SPDX-License-Identifier: GPL-3.0-only

//! Background image saver
//!
//! Captures are handed to [`ImageSaver::enqueue`] and finished on a single
//! worker thread, strictly in submission order:
//!
//! ```text
//! producer ──enqueue──▶ bounded queue ──▶ worker
//!                                          ├─ decode / stabilise / mirror / stamp
//!                                          ├─ HDR fusion (three exposures)
//!                                          ├─ encode + EXIF transplant
//!                                          └─ storage sink ──▶ SaveEvent channel
//! ```
//!
//! The queue holds `queue_capacity` requests ahead of the one being worked
//! on and blocks producers while it is full. HDR and multi-exposure batches
//! are followed by a [`SaveRequest::Dummy`] so they take two slots, which
//! throttles capture while the expensive save is outstanding.

use super::encoding;
use super::hdr::HdrProcessor;
use super::metadata::{self, MetadataPatch};
use super::processing;
use super::request::{JpegRequest, RawRequest, SaveRequest};
use super::stamp;
use super::thumbnail;
use crate::config::SaverConfig;
use crate::constants::{hdr as hdr_constants, naming};
use crate::errors::{AppResult, PhotoError, PhotoResult};
use crate::storage::{FsStorage, MediaKind, StorageSink};
use chrono::{DateTime, Local, Utc};
use image::RgbImage;
use std::borrow::Cow;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Stage a user-visible failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Decode,
    AutoStabilise,
    Stamp,
    Storage,
    Hdr,
    Raw,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::Decode => "Failed to decode image",
            FailureKind::AutoStabilise => "Failed to auto-stabilise",
            FailureKind::Stamp => "Failed to stamp image",
            FailureKind::Storage => "Failed to save image",
            FailureKind::Hdr => "Failed to process HDR",
            FailureKind::Raw => "Failed to save RAW",
        };
        write!(f, "{}", text)
    }
}

/// Results reported to whoever presents them
#[derive(Debug, Clone)]
pub enum SaveEvent {
    /// A file was written and published
    Saved {
        path: PathBuf,
        /// The file to offer for sharing when a batch wrote several
        share: bool,
    },
    /// Fresh gallery thumbnail, already upright
    ThumbnailReady(RgbImage),
    /// A stage failed; the message is for logs, the kind for the user
    Failed { kind: FailureKind, message: String },
}

pub type EventSender = mpsc::UnboundedSender<SaveEvent>;

/// Requests accepted but not yet finished
///
/// Incremented before a request enters the queue and decremented once the
/// worker is done with it, so `wait_until_zero` also covers the request in
/// flight.
#[derive(Debug, Default)]
struct PendingCounter {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingCounter {
    fn increment(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        // Underflow means a request was finished twice
        assert!(*count > 0, "pending save counter underflow");
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until_zero(&self) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _idle = self
            .idle
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Owns the save queue and its worker thread
///
/// Dropping the saver closes the queue, lets the worker finish everything
/// already accepted and joins it.
pub struct ImageSaver {
    sender: Option<mpsc::Sender<SaveRequest>>,
    /// Keeps a batch and its dummy adjacent under concurrent producers
    enqueue_lock: tokio::sync::Mutex<()>,
    pending: Arc<PendingCounter>,
    processor: Arc<SaveProcessor>,
    worker: Option<JoinHandle<()>>,
}

impl ImageSaver {
    /// Start a saver writing through `storage`
    pub fn new(
        config: SaverConfig,
        storage: Arc<dyn StorageSink>,
        events: Option<EventSender>,
    ) -> AppResult<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let pending = Arc::new(PendingCounter::default());
        let processor = Arc::new(SaveProcessor {
            storage,
            hdr: HdrProcessor::from_config(&config),
            config,
            events,
        });

        let worker = std::thread::Builder::new()
            .name(processor.config.worker_name.clone())
            .spawn({
                let processor = Arc::clone(&processor);
                let pending = Arc::clone(&pending);
                move || worker_loop(receiver, processor, pending)
            })?;

        info!(
            capacity = processor.config.queue_capacity,
            hdr_threads = processor.hdr.threads(),
            "Image saver started"
        );

        Ok(Self {
            sender: Some(sender),
            enqueue_lock: tokio::sync::Mutex::new(()),
            pending,
            processor,
            worker: Some(worker),
        })
    }

    /// Start a saver writing plain files to `config.output_dir`
    pub fn with_fs_storage(config: SaverConfig, events: Option<EventSender>) -> AppResult<Self> {
        let storage = Arc::new(FsStorage::new(config.output_dir.clone()));
        Self::new(config, storage, events)
    }

    pub fn config(&self) -> &SaverConfig {
        &self.processor.config
    }

    /// JPEG request carrying this saver's configured defaults
    pub fn jpeg_request(&self, images: Vec<Vec<u8>>, date: DateTime<Local>) -> JpegRequest {
        let mut request = JpegRequest::new(images, date);
        request.quality = self.processor.config.default_jpeg_quality;
        request.fix_gps_timestamp = self.processor.config.fix_gps_timestamp;
        request
    }

    /// Requests accepted and not yet finished, including the one in flight
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Queue a request, blocking while the queue is full
    ///
    /// Must not be called from inside an async runtime; use
    /// [`enqueue_async`](Self::enqueue_async) there.
    pub fn enqueue(&self, request: SaveRequest) -> PhotoResult<()> {
        let _guard = self.enqueue_lock.blocking_lock();
        let paired = request.needs_cost_pairing();
        debug!(
            kind = request.kind(),
            cost = request.cost(),
            pending = self.pending(),
            "Enqueueing save"
        );

        self.send_blocking(request)?;
        if paired {
            self.send_blocking(SaveRequest::Dummy)?;
        }
        Ok(())
    }

    /// Queue a request from async code, waiting while the queue is full
    pub async fn enqueue_async(&self, request: SaveRequest) -> PhotoResult<()> {
        let _guard = self.enqueue_lock.lock().await;
        let paired = request.needs_cost_pairing();
        debug!(
            kind = request.kind(),
            cost = request.cost(),
            pending = self.pending(),
            "Enqueueing save"
        );

        // Count only once a slot is held, so a cancelled wait leaves no trace
        let sender = self.sender()?;
        let permit = sender.reserve().await.map_err(|_| worker_gone())?;
        self.pending.increment();
        permit.send(request);
        if paired {
            let permit = sender.reserve().await.map_err(|_| worker_gone())?;
            self.pending.increment();
            permit.send(SaveRequest::Dummy);
        }
        Ok(())
    }

    fn send_blocking(&self, request: SaveRequest) -> PhotoResult<()> {
        let sender = self.sender()?;
        self.pending.increment();
        sender.blocking_send(request).map_err(|_| self.rejected())
    }

    fn sender(&self) -> PhotoResult<&mpsc::Sender<SaveRequest>> {
        self.sender
            .as_ref()
            .ok_or_else(|| PhotoError::SaveFailed("image saver is shut down".to_string()))
    }

    /// Undo the increment for a request the worker will never see
    fn rejected(&self) -> PhotoError {
        self.pending.decrement();
        worker_gone()
    }

    /// Block until every accepted request has been finished
    pub fn wait_until_done(&self) {
        debug!(pending = self.pending(), "Waiting for saves to finish");
        self.pending.wait_until_zero();
    }

    /// Save on the calling thread once the queue has drained
    pub fn save_now(&self, request: SaveRequest) -> PhotoResult<()> {
        self.wait_until_done();
        self.pending.increment();
        let result = self.processor.process(request);
        self.pending.decrement();
        result
    }

    /// Finish everything accepted so far and stop the worker
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Closing the channel ends the worker loop after the queue drains
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(()) => info!("Image saver stopped"),
                Err(_) => warn!("Image saver worker panicked"),
            }
        }
    }
}

impl Drop for ImageSaver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    mut receiver: mpsc::Receiver<SaveRequest>,
    processor: Arc<SaveProcessor>,
    pending: Arc<PendingCounter>,
) {
    debug!("Save worker running");
    while let Some(request) = receiver.blocking_recv() {
        let kind = request.kind();
        match catch_unwind(AssertUnwindSafe(|| processor.process(request))) {
            Ok(Ok(())) => debug!(kind, "Save request finished"),
            Ok(Err(e)) => warn!(kind, error = %e, "Save request failed"),
            Err(_) => error!(kind, "Save request panicked"),
        }
        pending.decrement();
    }
    debug!("Save queue closed");
}

/// Everything a save needs besides the request itself
struct SaveProcessor {
    storage: Arc<dyn StorageSink>,
    config: SaverConfig,
    hdr: HdrProcessor,
    events: Option<EventSender>,
}

impl SaveProcessor {
    fn emit(&self, event: SaveEvent) {
        if let Some(events) = &self.events
            && events.send(event).is_err()
        {
            debug!("Save event receiver dropped");
        }
    }

    fn fail(&self, kind: FailureKind, message: impl Into<String>) {
        let message = message.into();
        warn!(%kind, %message, "Save stage failed");
        self.emit(SaveEvent::Failed { kind, message });
    }

    fn process(&self, request: SaveRequest) -> PhotoResult<()> {
        match request {
            SaveRequest::Jpeg(request) => self.save_jpeg(request),
            SaveRequest::Raw(request) => self.save_raw(request),
            SaveRequest::Dummy => {
                debug!("Dummy request released");
                Ok(())
            }
        }
    }

    fn save_jpeg(&self, request: JpegRequest) -> PhotoResult<()> {
        if request.images.is_empty() {
            return Err(invalid("JPEG request without images"));
        }

        if request.is_hdr {
            self.save_hdr(&request)
        } else if request.images.len() > 1 {
            self.save_exposure_batch(&request)
        } else {
            self.save_single_image(&request, &request.images[0], None, "", true, true)
                .map(|_| ())
        }
    }

    fn save_hdr(&self, request: &JpegRequest) -> PhotoResult<()> {
        if request.images.len() != hdr_constants::EXPOSURE_COUNT {
            return Err(invalid(format!(
                "HDR request with {} images",
                request.images.len()
            )));
        }

        if request.save_exposures {
            for (index, data) in request.images.iter().enumerate() {
                let suffix = naming::exposure_suffix(index);
                if let Err(e) = self.save_single_image(request, data, None, &suffix, false, false) {
                    warn!(index, error = %e, "Failed to save HDR exposure");
                }
            }
        }

        let decoded = match processing::decode_batch(&request.images) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.fail(FailureKind::Hdr, e.to_string());
                return Err(e);
            }
        };
        let exposures: [RgbImage; 3] = decoded
            .try_into()
            .map_err(|_| invalid("decoded exposure count changed"))?;

        let fused = match self.hdr.process(exposures) {
            Ok(fused) => fused,
            Err(e) => {
                self.fail(FailureKind::Hdr, e.to_string());
                return Err(e.into());
            }
        };

        let base = &request.images[hdr_constants::BASE_EXPOSURE];
        self.save_single_image(request, base, Some(fused), naming::HDR_SUFFIX, true, true)
            .map(|_| ())
    }

    /// Bracketed exposures saved side by side; the middle one is shared
    fn save_exposure_batch(&self, request: &JpegRequest) -> PhotoResult<()> {
        let middle = request.images.len() / 2;
        let mut failed = 0usize;
        for (index, data) in request.images.iter().enumerate() {
            let suffix = naming::exposure_suffix(index);
            let share = index == middle;
            if let Err(e) = self.save_single_image(request, data, None, &suffix, true, share) {
                warn!(index, error = %e, "Failed to save exposure");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(PhotoError::SaveFailed(format!(
                "{} of {} exposures not saved",
                failed,
                request.images.len()
            )));
        }
        Ok(())
    }

    /// Decode lazily for a pixel stage; failures are reported and skipped
    fn ensure_pixels(
        &self,
        bitmap: Option<RgbImage>,
        data: &[u8],
        stage: FailureKind,
    ) -> Option<RgbImage> {
        if bitmap.is_some() {
            return bitmap;
        }
        match processing::decode(data) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                self.fail(stage, e.to_string());
                None
            }
        }
    }

    /// Run the transform chain on one image and write it
    ///
    /// `data` is the encoded original and the source of the EXIF tags;
    /// `bitmap` is an already decoded raster to use instead of decoding it.
    fn save_single_image(
        &self,
        request: &JpegRequest,
        data: &[u8],
        bitmap: Option<RgbImage>,
        suffix: &str,
        update_thumbnail: bool,
        share: bool,
    ) -> PhotoResult<PathBuf> {
        let mut bitmap = bitmap;

        if request.auto_stabilise {
            bitmap = self
                .ensure_pixels(bitmap, data, FailureKind::AutoStabilise)
                .map(|b| processing::auto_stabilise(b, request.level_angle, request.is_front_facing));
        }
        if request.mirror {
            bitmap = self
                .ensure_pixels(bitmap, data, FailureKind::Decode)
                .map(processing::mirror_image);
        }
        if request.stamp.is_enabled() {
            bitmap = self
                .ensure_pixels(bitmap, data, FailureKind::Stamp)
                .map(|mut b| {
                    stamp::stamp_overlay(
                        &mut b,
                        &request.stamp,
                        &request.date,
                        request.location.as_ref(),
                        request.heading,
                    );
                    b
                });
        }

        let patch = MetadataPatch {
            heading: request.heading,
            gps_timestamp: (request.fix_gps_timestamp && request.location.is_some())
                .then(|| request.date.with_timezone(&Utc)),
        };

        let mut orientation = None;
        let output: Cow<[u8]> = match &bitmap {
            Some(raster) => {
                let jpeg = encoding::encode_jpeg(raster, request.quality)
                    .inspect_err(|e| self.fail(FailureKind::Storage, e.to_string()))?;
                match metadata::read_tags(data) {
                    Ok(tags) => {
                        orientation = tags.orientation();
                        match metadata::transplant(&tags, &jpeg, &patch) {
                            Ok(with_tags) => Cow::Owned(with_tags),
                            Err(e) => {
                                metadata::log_failure("transplant", &e);
                                Cow::Owned(jpeg)
                            }
                        }
                    }
                    Err(e) => {
                        metadata::log_failure("read", &e);
                        Cow::Owned(jpeg)
                    }
                }
            }
            None if !patch.is_empty() => match metadata::read_tags(data) {
                Ok(tags) => {
                    orientation = tags.orientation();
                    match metadata::patch_in_place(data, &tags, &patch) {
                        Ok(patched) => Cow::Owned(patched),
                        Err(e) => {
                            metadata::log_failure("patch", &e);
                            Cow::Borrowed(data)
                        }
                    }
                }
                Err(e) => {
                    metadata::log_failure("read", &e);
                    Cow::Borrowed(data)
                }
            },
            None => Cow::Borrowed(data),
        };

        let handle = self
            .storage
            .create(MediaKind::Image, suffix, naming::JPEG_EXTENSION, &request.date)
            .inspect_err(|e| self.fail(FailureKind::Storage, e.to_string()))?;
        if let Err(e) = self.storage.write(&handle, &output) {
            self.fail(FailureKind::Storage, e.to_string());
            self.storage.discard(&handle);
            return Err(e.into());
        }
        self.storage.publish(&handle, true, update_thumbnail);
        info!(
            path = %handle.path.display(),
            bytes = output.len(),
            reencoded = bitmap.is_some(),
            share,
            "Image saved"
        );
        self.emit(SaveEvent::Saved {
            path: handle.path.clone(),
            share,
        });

        if update_thumbnail {
            if orientation.is_none() {
                orientation = metadata::read_tags(&output)
                    .ok()
                    .and_then(|tags| tags.orientation());
            }
            match thumbnail::regenerate(
                bitmap.as_ref(),
                &output,
                self.config.preview_width,
                request.thumbnail_sample_factor,
                orientation,
            ) {
                Ok(thumb) => self.emit(SaveEvent::ThumbnailReady(thumb)),
                Err(e) => warn!(error = %e, "Thumbnail regeneration failed"),
            }
        }

        Ok(handle.path)
    }

    fn save_raw(&self, request: RawRequest) -> PhotoResult<()> {
        let dng = encoding::encode_dng(&request.image, &request.calibration)
            .inspect_err(|e| self.fail(FailureKind::Raw, e.to_string()))?;
        // Sensor samples are no longer needed once encoded
        drop(request.image);

        let handle = self
            .storage
            .create(MediaKind::Raw, "", naming::DNG_EXTENSION, &request.date)
            .inspect_err(|e| self.fail(FailureKind::Raw, e.to_string()))?;
        if let Err(e) = self.storage.write(&handle, &dng) {
            self.fail(FailureKind::Raw, e.to_string());
            self.storage.discard(&handle);
            return Err(e.into());
        }
        self.storage.publish(&handle, true, false);

        info!(path = %handle.path.display(), bytes = dng.len(), "RAW saved");
        self.emit(SaveEvent::Saved {
            path: handle.path,
            share: false,
        });
        Ok(())
    }
}

fn worker_gone() -> PhotoError {
    error!("Save worker is gone, request dropped");
    PhotoError::SaveFailed("save worker stopped".to_string())
}

fn invalid(message: impl Into<String>) -> PhotoError {
    let message = message.into();
    error!(%message, "Invalid save request");
    PhotoError::InvalidRequest(message)
}
