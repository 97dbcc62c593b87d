// SPDX-License-Identifier: GPL-3.0-only

//! Storage sink for saved photos
//!
//! The saver never touches the filesystem layout directly: it asks a
//! [`StorageSink`] for a handle, writes the final bytes through it and then
//! publishes the handle so galleries and media scanners can pick it up.

use crate::constants::naming;
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Kind of media a handle is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Processed image (JPEG)
    Image,
    /// Raw sensor capture (DNG)
    Raw,
}

/// Destination of a single saved file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandle {
    pub path: PathBuf,
    pub kind: MediaKind,
}

/// Where finished photos go
pub trait StorageSink: Send + Sync {
    /// Reserve an output for a capture taken at `date`
    fn create(
        &self,
        kind: MediaKind,
        suffix: &str,
        extension: &str,
        date: &DateTime<Local>,
    ) -> io::Result<StorageHandle>;

    /// Write the complete file contents
    fn write(&self, handle: &StorageHandle, data: &[u8]) -> io::Result<()> {
        std::fs::write(&handle.path, data)
    }

    /// Announce a finished file
    fn publish(&self, handle: &StorageHandle, is_visible: bool, notify_thumbnail: bool);

    /// Release an output that will never be written completely
    fn discard(&self, handle: &StorageHandle) {
        if let Err(e) = std::fs::remove_file(&handle.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %handle.path.display(), error = %e, "Failed to remove unfinished output");
        }
    }
}

/// Stores photos as plain files in one directory
pub struct FsStorage {
    root: PathBuf,
    published: Mutex<Vec<PathBuf>>,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files published so far, oldest first
    pub fn published(&self) -> Vec<PathBuf> {
        self.published
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Most recently published file
    pub fn last_published(&self) -> Option<PathBuf> {
        self.published
            .lock()
            .ok()
            .and_then(|list| list.last().cloned())
    }
}

/// `IMG_20240101_120000_HDR.jpg`, with `_n` appended for the nth collision
pub fn media_file_name(
    suffix: &str,
    extension: &str,
    date: &DateTime<Local>,
    collision: u32,
) -> String {
    let timestamp = date.format(naming::TIMESTAMP_FORMAT);
    if collision == 0 {
        format!("{}{}{}.{}", naming::IMAGE_PREFIX, timestamp, suffix, extension)
    } else {
        format!(
            "{}{}{}_{}.{}",
            naming::IMAGE_PREFIX,
            timestamp,
            suffix,
            collision,
            extension
        )
    }
}

impl StorageSink for FsStorage {
    fn create(
        &self,
        kind: MediaKind,
        suffix: &str,
        extension: &str,
        date: &DateTime<Local>,
    ) -> io::Result<StorageHandle> {
        std::fs::create_dir_all(&self.root)?;

        let mut collision = 0;
        loop {
            let path = self
                .root
                .join(media_file_name(suffix, extension, date, collision));
            // create_new reserves the name so a second capture in the same
            // second cannot claim it before we write
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), ?kind, "Created output file");
                    return Ok(StorageHandle { path, kind });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => collision += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(&self, handle: &StorageHandle, is_visible: bool, notify_thumbnail: bool) {
        info!(
            path = %handle.path.display(),
            is_visible,
            notify_thumbnail,
            "Photo published"
        );
        if let Ok(mut list) = self.published.lock() {
            list.push(handle.path.clone());
        }
    }

    fn discard(&self, handle: &StorageHandle) {
        debug!(path = %handle.path.display(), "Discarding unfinished output");
        if let Err(e) = std::fs::remove_file(&handle.path) {
            warn!(path = %handle.path.display(), error = %e, "Failed to remove unfinished output");
        }
    }
}
