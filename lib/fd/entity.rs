//! Per-object open-file state.
//!
//! A [`FileEntity`] owns the on-disk staging file for one open object plus
//! the [`PageMap`] describing which byte ranges of it are populated or
//! locally written. Entities are shared between all handles open on the
//! same key and destroyed when the last handle is released.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt as _, OpenOptionsExt as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use sha2::{Digest as _, Sha256};

use crate::error::{StoreError, StoreResult};
use crate::meta::Meta;
use crate::page_map::{ByteRange, PageMap};

/// Upload state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Staging mirrors the stored object.
    Clean,
    /// Local writes have not been uploaded.
    Dirty,
    /// A flush is in progress.
    Uploading,
    /// The last flush failed; the error is delivered to the next operation.
    Error,
}

#[derive(Debug)]
pub(crate) struct EntityInner {
    pub pages: PageMap,
    pub state: EntityState,
    /// Curated headers re-emitted on upload.
    pub meta: Meta,
    /// Number of open handles.
    pub refs: u32,
    /// Pseudo-fd namespace: each open on this entity gets a unique small id.
    pub next_fd: u32,
    /// Errno from a failed flush, surfaced to the next operation.
    pub pending_errno: Option<i32>,
    /// Created locally and not uploaded yet; its stat-cache entry is pinned.
    pub pinned: bool,
}

/// Staging file name for a key: hex SHA-256, flat under the staging dir.
pub(crate) fn staging_file_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[derive(Debug)]
pub struct FileEntity {
    key: String,
    staging_path: PathBuf,
    file: File,
    pub(crate) inner: Mutex<EntityInner>,
}

impl FileEntity {
    /// Create the staging file (sparse, mode 0600) and the page map for an
    /// object of `size` bytes.
    pub(crate) fn create(
        key: &str,
        staging_dir: &Path,
        size: u64,
        meta: Meta,
        pinned: bool,
    ) -> StoreResult<Self> {
        std::fs::create_dir_all(staging_dir)?;
        let staging_path = staging_dir.join(staging_file_name(key));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&staging_path)?;
        file.set_len(size)?;

        Ok(Self {
            key: key.to_owned(),
            staging_path,
            file,
            inner: Mutex::new(EntityInner {
                pages: PageMap::new(size),
                state: if pinned {
                    EntityState::Dirty
                } else {
                    EntityState::Clean
                },
                meta,
                refs: 0,
                next_fd: 1,
                pending_errno: None,
                pinned,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, EntityInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn state(&self) -> EntityState {
        self.lock().state
    }

    pub fn size(&self) -> u64 {
        self.lock().pages.size()
    }

    /// Read exactly `range` from the staging file. Unwritten regions of the
    /// sparse file read as zeros.
    pub(crate) fn read_staging(&self, range: ByteRange) -> StoreResult<Bytes> {
        let mut buf = vec![0u8; usize::try_from(range.len).map_err(range_too_large)?];
        self.file.read_exact_at(&mut buf, range.offset)?;
        Ok(Bytes::from(buf))
    }

    /// Write `data` into the staging file at `offset`.
    pub(crate) fn write_staging(&self, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub(crate) fn set_staging_len(&self, len: u64) -> StoreResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Delete the staging file. Called when the entity is destroyed.
    pub(crate) fn remove_staging(&self) {
        if let Err(e) = std::fs::remove_file(&self.staging_path) {
            tracing::warn!(key = %self.key, error = %e, "failed to remove staging file");
        }
    }

    /// Take the sticky flush error, if any, reverting the entity to Dirty
    /// so the next flush retries.
    pub(crate) fn take_pending_error(&self) -> Option<StoreError> {
        let mut inner = self.lock();
        let errno = inner.pending_errno.take()?;
        inner.state = EntityState::Dirty;
        Some(StoreError::LocalIo(std::io::Error::from_raw_os_error(
            errno,
        )))
    }
}

fn range_too_large(_: std::num::TryFromIntError) -> StoreError {
    StoreError::ClientFatal("range exceeds addressable memory".into())
}
