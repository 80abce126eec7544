//! The file-descriptor cache: open-object staging and upload orchestration.
//!
//! Owns the mapping from object key to [`FileEntity`]. Reads fill the
//! staging file with parallel range-GETs for whatever the page map says is
//! missing; writes land in the staging file only; flush turns the dirty
//! page map into a simple PUT or a mixed multipart upload.

pub mod entity;
pub mod multipart;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use scc::HashMap as ConcurrentHashMap;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::StatCache;
use crate::error::{StoreError, StoreResult};
use crate::meta::Meta;
use crate::page_map::ByteRange;
use crate::pool::{CancelFlag, RequestPool};
use crate::store::{ObjectStore, RetryPolicy, with_retries};

pub use entity::{EntityState, FileEntity};
use multipart::{PartSource, partition};

/// A handle to one open on an entity. The fd is unique within the entity's
/// pseudo-fd namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    key: String,
    fd: u32,
}

impl OpenHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fd(&self) -> u32 {
        self.fd
    }
}

/// How `open` should behave for missing or existing objects.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Create the object if it does not exist (`O_CREAT`).
    pub create: bool,
    /// Discard existing content (`O_TRUNC`).
    pub truncate: bool,
    /// Headers for a newly created object (mode, owner, mtime).
    pub create_meta: Meta,
}

#[derive(Debug, Clone)]
pub struct FdCacheConfig {
    /// Directory holding staging files.
    pub staging_dir: PathBuf,
    /// Fetch/upload granularity `P`; also the multipart part size.
    pub part_size: u64,
    /// Size above which flush uses multipart upload.
    pub multipart_threshold: u64,
    pub retry: RetryPolicy,
}

impl Default for FdCacheConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("bucketfs"),
            part_size: 10 * 1024 * 1024,
            multipart_threshold: 20 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct FdCache<S: ObjectStore> {
    store: Arc<S>,
    pool: RequestPool,
    stat_cache: Arc<StatCache>,
    config: FdCacheConfig,
    /// Key to open entity; sharded map, safe from any task.
    entities: ConcurrentHashMap<String, Arc<FileEntity>>,
}

impl<S: ObjectStore> FdCache<S> {
    pub fn new(
        store: Arc<S>,
        pool: RequestPool,
        stat_cache: Arc<StatCache>,
        config: FdCacheConfig,
    ) -> Self {
        assert!(
            config.part_size >= multipart::MIN_PART_SIZE,
            "part size below the 5 MiB protocol floor"
        );
        Self {
            store,
            pool,
            stat_cache,
            config,
            entities: ConcurrentHashMap::new(),
        }
    }

    /// The open entity for `key`, if any.
    pub fn entity(&self, key: &str) -> Option<Arc<FileEntity>> {
        self.entities.read(key, |_, v| Arc::clone(v))
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.entities.contains(key)
    }

    fn entity_of(&self, handle: &OpenHandle) -> StoreResult<Arc<FileEntity>> {
        self.entity(&handle.key)
            .ok_or_else(|| StoreError::ClientFatal(format!("stale handle for {}", handle.key)))
    }

    /// Open `key`, creating or joining its entity.
    ///
    /// A fresh entity sizes its staging file from the stat cache or a HEAD.
    /// With [`OpenOptions::create`] and a missing object, an empty entity is
    /// created and its stat-cache entry pinned, so the file is visible in
    /// the namespace before the first upload.
    pub async fn open(&self, key: &str, opts: OpenOptions) -> StoreResult<OpenHandle> {
        if let Some(handle) = self.try_attach(key, opts.truncate)? {
            return Ok(handle);
        }

        // Resolve size and metadata outside the table lock.
        let resolved = match self.resolve_meta(key).await {
            Ok(meta) => Some(meta),
            Err(StoreError::NotFound) if opts.create => None,
            Err(e) => return Err(e),
        };

        let (meta, size, pinned) = match resolved {
            Some(meta) => {
                let size = crate::meta::size_of(&meta);
                (meta.curated(), size, false)
            }
            None => (opts.create_meta.curated(), 0, true),
        };

        use scc::hash_map::Entry;
        let handle = match self.entities.entry(key.to_owned()) {
            Entry::Occupied(occ) => {
                // Raced with another open of the same key.
                let entity = Arc::clone(occ.get());
                drop(occ);
                let fd = {
                    let mut inner = entity.lock();
                    inner.refs += 1;
                    let fd = inner.next_fd;
                    inner.next_fd += 1;
                    if opts.truncate {
                        inner.pages.resize(0);
                        inner.state = EntityState::Dirty;
                    }
                    fd
                };
                if opts.truncate {
                    entity.set_staging_len(0)?;
                }
                return Ok(OpenHandle {
                    key: key.to_owned(),
                    fd,
                });
            }
            Entry::Vacant(vac) => {
                let entity = Arc::new(FileEntity::create(
                    key,
                    &self.config.staging_dir,
                    size,
                    meta.clone(),
                    pinned,
                )?);
                {
                    let mut inner = entity.lock();
                    inner.refs = 1;
                    inner.next_fd = 2;
                    if opts.truncate && size > 0 {
                        inner.pages.resize(0);
                        inner.state = EntityState::Dirty;
                    }
                }
                if opts.truncate && size > 0 {
                    entity.set_staging_len(0)?;
                }
                vac.insert_entry(entity);
                OpenHandle {
                    key: key.to_owned(),
                    fd: 1,
                }
            }
        };

        if pinned {
            self.stat_cache.put(key, &meta, false, true);
        }
        debug!(%key, size, pinned, "opened entity");
        Ok(handle)
    }

    fn try_attach(&self, key: &str, truncate: bool) -> StoreResult<Option<OpenHandle>> {
        let Some(entity) = self.entity(key) else {
            return Ok(None);
        };

        let fd = {
            let mut inner = entity.lock();
            inner.refs += 1;
            let fd = inner.next_fd;
            inner.next_fd += 1;
            if truncate {
                inner.pages.resize(0);
                inner.state = EntityState::Dirty;
            }
            fd
        };
        if truncate {
            entity.set_staging_len(0)?;
        }
        Ok(Some(OpenHandle {
            key: key.to_owned(),
            fd,
        }))
    }

    async fn resolve_meta(&self, key: &str) -> StoreResult<Meta> {
        match self.stat_cache.get(key, false, None) {
            crate::cache::Lookup::Hit(snap) => return Ok(snap.meta),
            crate::cache::Lookup::Negative => return Err(StoreError::NotFound),
            crate::cache::Lookup::Miss => {}
        }
        match self.store.head(key).await {
            Ok(meta) => {
                self.stat_cache.put(key, &meta, false, false);
                Ok(meta)
            }
            Err(StoreError::NotFound) => {
                self.stat_cache.put_negative(key);
                Err(StoreError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Read `len` bytes at `offset`, fetching missing ranges first.
    pub async fn read(&self, handle: &OpenHandle, offset: u64, len: u32) -> StoreResult<Bytes> {
        let entity = self.entity_of(handle)?;
        if let Some(e) = entity.take_pending_error() {
            return Err(e);
        }

        let (range, plan) = {
            let inner = entity.lock();
            let size = inner.pages.size();
            if offset >= size {
                return Ok(Bytes::new());
            }
            let range = ByteRange::new(offset, u64::from(len).min(size - offset));
            let plan = if inner.pinned {
                // Never uploaded: holes are zeros, nothing to fetch.
                Vec::new()
            } else {
                inner
                    .pages
                    .unloaded_ranges(range)
                    .into_iter()
                    .flat_map(|r| r.chunks(self.config.part_size))
                    .collect()
            };
            (range, plan)
        };

        self.load_ranges(&entity, plan).await?;
        entity.read_staging(range)
    }

    /// Write into the staging file; no network I/O.
    pub async fn write(&self, handle: &OpenHandle, offset: u64, data: &[u8]) -> StoreResult<usize> {
        let entity = self.entity_of(handle)?;
        if let Some(e) = entity.take_pending_error() {
            return Err(e);
        }
        entity.write_staging(offset, data)?;
        let mut inner = entity.lock();
        inner
            .pages
            .mark_modified(ByteRange::new(offset, data.len() as u64));
        inner.state = EntityState::Dirty;
        Ok(data.len())
    }

    /// Upload the entity for `handle` if it is dirty.
    pub async fn flush(&self, handle: &OpenHandle) -> StoreResult<()> {
        let entity = self.entity_of(handle)?;
        self.flush_entity(&entity).await
    }

    /// Upload the entity for `key` if one is open and dirty.
    pub async fn flush_key(&self, key: &str) -> StoreResult<()> {
        match self.entity(key) {
            Some(entity) => self.flush_entity(&entity).await,
            None => Ok(()),
        }
    }

    async fn flush_entity(&self, entity: &Arc<FileEntity>) -> StoreResult<()> {
        let key = entity.key().to_owned();
        let (size, modified, meta, pinned) = {
            let mut inner = entity.lock();
            match inner.state {
                EntityState::Clean | EntityState::Uploading => return Ok(()),
                EntityState::Dirty => {}
                EntityState::Error => {
                    // A new flush supersedes the sticky error.
                    inner.pending_errno = None;
                }
            }
            inner.state = EntityState::Uploading;
            (
                inner.pages.size(),
                inner.pages.modified_ranges(),
                inner.meta.curated(),
                inner.pinned,
            )
        };

        let result = self.upload(entity, size, &modified, &meta, pinned).await;

        let mut inner = entity.lock();
        match result {
            Ok(()) => {
                // A write that landed mid-upload flipped the state back to
                // Dirty; its pages were not all shipped, so keep them marked
                // and let the next flush pick them up.
                if inner.state == EntityState::Uploading {
                    inner.pages.clear_modified();
                    inner.state = EntityState::Clean;
                }
                let was_pinned = std::mem::take(&mut inner.pinned);
                drop(inner);

                let mut patch = Meta::new();
                patch.insert("Content-Length", size.to_string());
                self.stat_cache.update_meta(&key, &patch);
                if was_pinned {
                    self.stat_cache.unpin(&key);
                }
                debug!(%key, size, "flush complete");
                Ok(())
            }
            Err(e) => {
                inner.state = EntityState::Error;
                inner.pending_errno = Some(e.errno());
                drop(inner);
                warn!(%key, error = %e, "flush failed; entity stays dirty");
                Err(e)
            }
        }
    }

    async fn upload(
        &self,
        entity: &Arc<FileEntity>,
        size: u64,
        modified: &[ByteRange],
        meta: &Meta,
        never_uploaded: bool,
    ) -> StoreResult<()> {
        let key = entity.key().to_owned();
        let full = ByteRange::new(0, size);

        if size <= self.config.multipart_threshold {
            if !never_uploaded {
                let plan: Vec<ByteRange> = {
                    let inner = entity.lock();
                    inner
                        .pages
                        .unloaded_ranges(full)
                        .into_iter()
                        .flat_map(|r| r.chunks(self.config.part_size))
                        .collect()
                };
                self.load_ranges(entity, plan).await?;
            }
            let body = entity.read_staging(full)?;
            let cancel = CancelFlag::new();
            return with_retries(&self.config.retry, &cancel, "put object", || {
                self.store.put(&key, body.clone(), meta)
            })
            .await;
        }

        // A never-uploaded object has no prior version to copy from; its
        // holes are zeros in the staging file and must be uploaded.
        let plans = if never_uploaded {
            partition(size, &[full], self.config.part_size)
        } else {
            partition(size, modified, self.config.part_size)
        };

        if !never_uploaded {
            // Upload slots must be fully materialized before dispatch.
            let to_load: Vec<ByteRange> = {
                let inner = entity.lock();
                plans
                    .iter()
                    .filter_map(|p| match p.source {
                        PartSource::Staging(r) => Some(r),
                        PartSource::Copy(_) => None,
                    })
                    .flat_map(|r| inner.pages.unloaded_ranges(r))
                    .flat_map(|r| r.chunks(self.config.part_size))
                    .collect()
            };
            self.load_ranges(entity, to_load).await?;
        }

        multipart::upload(
            &self.store,
            &self.pool,
            &self.config.retry,
            entity,
            meta,
            plans,
        )
        .await
    }

    /// Release one handle. The last release flushes a dirty entity and then
    /// destroys it along with its staging file. A failed flush keeps the
    /// entity (and the staged bytes) so a later open or unmount can retry.
    pub async fn release(&self, handle: &OpenHandle) -> StoreResult<()> {
        let Some(entity) = self.entity(&handle.key) else {
            return Ok(());
        };
        let remaining = {
            let mut inner = entity.lock();
            inner.refs = inner.refs.saturating_sub(1);
            inner.refs
        };
        if remaining > 0 {
            return Ok(());
        }

        if matches!(entity.state(), EntityState::Dirty | EntityState::Error) {
            self.flush_entity(&entity).await?;
        }

        // A concurrent open may have attached while we were flushing.
        let removed = self
            .entities
            .remove_if(&handle.key, |v| v.lock().refs == 0);
        if removed.is_some() {
            entity.remove_staging();
            debug!(key = %handle.key, "entity destroyed");
        }
        Ok(())
    }

    /// Resize an open entity. Returns `false` when no entity is open for
    /// `key` (the caller falls back to a store-side truncate).
    pub fn truncate_open(&self, key: &str, new_size: u64) -> StoreResult<bool> {
        let Some(entity) = self.entity(key) else {
            return Ok(false);
        };
        if let Some(e) = entity.take_pending_error() {
            return Err(e);
        }
        {
            let mut inner = entity.lock();
            let old = inner.pages.size();
            inner.pages.resize(new_size);
            if new_size > old {
                // The extension reads as zeros and must upload as zeros.
                inner.pages.mark_modified(ByteRange::new(old, new_size - old));
            }
            inner.state = EntityState::Dirty;
        }
        entity.set_staging_len(new_size)?;
        Ok(true)
    }

    /// Best-effort flush of every dirty entity (shutdown path). Returns the
    /// first error after attempting all of them.
    pub async fn flush_all(&self) -> StoreResult<()> {
        let mut entities: Vec<Arc<FileEntity>> = Vec::new();
        self.entities.scan(|_, v| {
            entities.push(Arc::clone(v));
        });
        let mut first = None;
        for entity in entities {
            if let Err(e) = self.flush_entity(&entity).await {
                warn!(key = %entity.key(), error = %e, "flush-all: entity failed");
                first.get_or_insert(e);
            }
        }
        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Fetch `ranges` into the staging file with bounded parallel GETs.
    /// Each task marks its own slice loaded; the first fatal error cancels
    /// the rest of the group between attempts.
    async fn load_ranges(
        &self,
        entity: &Arc<FileEntity>,
        ranges: Vec<ByteRange>,
    ) -> StoreResult<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let cancel = CancelFlag::new();
        let mut set: JoinSet<Option<StoreError>> = JoinSet::new();
        for range in ranges {
            let store = Arc::clone(&self.store);
            let entity = Arc::clone(entity);
            let retry = self.config.retry;
            let cancel = cancel.clone();
            self.pool.spawn_on(&mut set, async move {
                let key = entity.key().to_owned();
                let body = match with_retries(&retry, &cancel, "range get", || {
                    store.get_range(&key, range)
                })
                .await
                {
                    Ok(b) => b,
                    Err(e) => {
                        cancel.cancel();
                        return Some(e);
                    }
                };
                if body.len() as u64 != range.len {
                    cancel.cancel();
                    return Some(StoreError::Integrity(format!(
                        "range GET returned {} bytes, wanted {}",
                        body.len(),
                        range.len
                    )));
                }
                if let Err(e) = entity.write_staging(range.offset, &body) {
                    cancel.cancel();
                    return Some(e);
                }
                entity.lock().pages.mark_loaded(range);
                None
            });
        }

        let mut first = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(None) => {}
                Ok(Some(e)) => {
                    first.get_or_insert(e);
                }
                Err(join_err) => {
                    first.get_or_insert(StoreError::ClientFatal(format!(
                        "fetch task died: {join_err}"
                    )));
                }
            }
        }
        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
