//! The filesystem facade over an object store.
//!
//! [`ObjFs`] composes the stat cache, symlink cache and fd cache into the
//! operation set the FUSE adapter calls. Paths are absolute (`/a/b`);
//! object keys are the same strings without the leading slash, with
//! directory markers keyed as `a/b/`.
//!
//! Consistency follows the substrate: single-mount POSIX semantics, last
//! writer wins per byte, no cross-object atomicity (a directory rename is
//! a per-descendant copy + delete and can be observed half-done).

pub mod listing;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::cache::{Lookup, StatCache, SymlinkCache};
use crate::error::{StoreError, StoreResult};
use crate::fd::{FdCache, FdCacheConfig, OpenHandle, OpenOptions};
use crate::meta::{DIR_CONTENT_TYPE, FOLDER_SUFFIX, FileStat, Meta, stat_from_meta};
use crate::page_map::ByteRange;
use crate::pool::{CancelFlag, RequestPool};
use crate::store::{ObjectStore, RetryPolicy, with_retries};

use listing::{ChildEntry, ObjectList};

/// Owner applied to objects that carry no uid/gid metadata, and to the
/// synthesized root directory.
#[derive(Debug, Clone, Copy)]
pub struct ObjFsConfig {
    pub uid: u32,
    pub gid: u32,
    pub retry: RetryPolicy,
}

impl Default for ObjFsConfig {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            retry: RetryPolicy::default(),
        }
    }
}

/// One readdir row. `stat` is present when the metadata was already cached
/// or primed by the readdir multi-HEAD pass.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub stat: Option<FileStat>,
}

fn errno_err(errno: i32) -> StoreError {
    StoreError::LocalIo(std::io::Error::from_raw_os_error(errno))
}

fn epoch_string(t: SystemTime) -> String {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:09}", d.as_secs(), d.subsec_nanos())
}

pub struct ObjFs<S: ObjectStore> {
    store: Arc<S>,
    pool: RequestPool,
    stats: Arc<StatCache>,
    symlinks: SymlinkCache,
    fds: FdCache<S>,
    config: ObjFsConfig,
}

impl<S: ObjectStore> ObjFs<S> {
    pub fn new(
        store: Arc<S>,
        pool: RequestPool,
        stats: Arc<StatCache>,
        symlinks: SymlinkCache,
        fd_config: FdCacheConfig,
        config: ObjFsConfig,
    ) -> Self {
        let fds = FdCache::new(
            Arc::clone(&store),
            pool.clone(),
            Arc::clone(&stats),
            fd_config,
        );
        Self {
            store,
            pool,
            stats,
            symlinks,
            fds,
            config,
        }
    }

    pub fn stat_cache(&self) -> &Arc<StatCache> {
        &self.stats
    }

    pub fn fd_cache(&self) -> &FdCache<S> {
        &self.fds
    }

    /// `/a/b` -> `a/b`; `/` -> ``.
    fn key_of(path: &str) -> &str {
        path.trim_start_matches('/')
    }

    /// Directory listing prefix for a key: `a/b` -> `a/b/`, root -> ``.
    fn dir_prefix(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        }
    }

    fn root_stat(&self) -> FileStat {
        FileStat {
            mode: libc::S_IFDIR | 0o755,
            uid: self.config.uid,
            gid: self.config.gid,
            size: 0,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            atime: UNIX_EPOCH,
        }
    }

    fn fill_owner(&self, stat: &mut FileStat, meta: &Meta) {
        if crate::meta::uid_of(meta).is_none() {
            stat.uid = self.config.uid;
        }
        if crate::meta::gid_of(meta).is_none() {
            stat.gid = self.config.gid;
        }
    }

    // ------------------------------------------------------------------
    // getattr
    // ------------------------------------------------------------------

    /// Stat a path: cache first, then HEAD with directory-variant
    /// overcheck, then an implicit-prefix probe. Confirmed 404s enter the
    /// negative cache.
    #[instrument(skip(self))]
    pub async fn getattr(&self, path: &str) -> StoreResult<FileStat> {
        let key = Self::key_of(path);
        if key.is_empty() {
            return Ok(self.root_stat());
        }

        let mut stat = match self.stats.get(key, true, None) {
            Lookup::Hit(snap) => {
                let mut stat = snap.stat;
                self.fill_owner(&mut stat, &snap.meta);
                stat
            }
            Lookup::Negative => return Err(StoreError::NotFound),
            Lookup::Miss => self.stat_from_store(key).await?,
        };

        // An open entity's staged size supersedes the cached one.
        if !stat.is_dir()
            && let Some(entity) = self.fds.entity(key)
        {
            stat.size = entity.size();
        }
        Ok(stat)
    }

    /// Resolve a cache miss against the store, trying `key`, `key/` and the
    /// legacy folder marker before concluding the object is absent or an
    /// implicit directory.
    async fn stat_from_store(&self, key: &str) -> StoreResult<FileStat> {
        debug_assert!(!key.is_empty() && !key.ends_with('/'));

        match self.store.head(key).await {
            Ok(meta) => {
                // A zero-body object typed as a directory is a marker in
                // non-canonical spelling.
                let forced_dir = crate::meta::is_dir_meta(&meta, key);
                let cache_key = if forced_dir {
                    format!("{key}/")
                } else {
                    key.to_owned()
                };
                self.stats.put(&cache_key, &meta, forced_dir, false);
                let mut stat = stat_from_meta(&cache_key, &meta, forced_dir);
                self.fill_owner(&mut stat, &meta);
                return Ok(stat);
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let dir_key = format!("{key}/");
        match self.store.head(&dir_key).await {
            Ok(meta) => {
                self.stats.put(&dir_key, &meta, false, false);
                let mut stat = stat_from_meta(&dir_key, &meta, false);
                self.fill_owner(&mut stat, &meta);
                return Ok(stat);
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }

        match self.store.head(&format!("{key}{FOLDER_SUFFIX}")).await {
            Ok(meta) => {
                self.stats.put(&dir_key, &meta, true, false);
                let mut stat = stat_from_meta(&dir_key, &meta, true);
                self.fill_owner(&mut stat, &meta);
                return Ok(stat);
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }

        // No marker object; children alone make a directory.
        let page = self.store.list(&dir_key, true, None).await?;
        if !page.entries.is_empty() || !page.common_prefixes.is_empty() {
            self.stats.put(&dir_key, &Meta::new(), true, false);
            let mut stat = stat_from_meta(&dir_key, &Meta::new(), true);
            self.fill_owner(&mut stat, &Meta::new());
            return Ok(stat);
        }

        self.stats.put_negative(key);
        Err(StoreError::NotFound)
    }

    // ------------------------------------------------------------------
    // readdir
    // ------------------------------------------------------------------

    /// List a directory: paginated delimited listing, normalized markers,
    /// pinned (not-yet-uploaded) children mixed in, and metadata primed
    /// with a bounded multi-HEAD pass.
    #[instrument(skip(self))]
    pub async fn readdir(&self, path: &str) -> StoreResult<Vec<DirEntry>> {
        let key = Self::key_of(path);
        let prefix = Self::dir_prefix(key);

        let mut list = ObjectList::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .store
                .list(&prefix, true, token.as_deref())
                .await?;
            for entry in &page.entries {
                let Some(suffix) = entry.key.strip_prefix(prefix.as_str()) else {
                    continue;
                };
                list.insert_object(suffix, entry.etag.as_deref(), entry.size);
            }
            for p in &page.common_prefixes {
                if let Some(suffix) = p.strip_prefix(prefix.as_str()) {
                    list.insert_prefix(suffix);
                }
            }
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        // Files open before their first upload exist only in the namespace.
        for name in self
            .stats
            .list_pinned(if key.is_empty() { "/" } else { prefix.as_str() })
        {
            list.insert_synthetic(&name);
        }

        let entries = list.into_entries();
        self.prime_stats(&prefix, &entries).await?;

        Ok(entries
            .into_iter()
            .map(|e| {
                let child_key = self.child_key(&prefix, &e);
                let stat = match self.stats.get(&child_key, false, None) {
                    Lookup::Hit(snap) => {
                        let mut stat = snap.stat;
                        self.fill_owner(&mut stat, &snap.meta);
                        Some(stat)
                    }
                    _ => None,
                };
                DirEntry {
                    is_dir: e.is_dir || stat.is_some_and(|s| s.is_dir()),
                    name: e.name,
                    stat,
                }
            })
            .collect())
    }

    fn child_key(&self, prefix: &str, entry: &ChildEntry) -> String {
        if entry.is_dir {
            format!("{prefix}{}/", entry.name)
        } else {
            format!("{prefix}{}", entry.name)
        }
    }

    /// Fan out HEADs for children whose stat is missing or whose cached
    /// ETag no longer matches the listing. Each sub-request has its own
    /// retry budget; a 404 is tolerated (the child may have vanished since
    /// the listing) but any other failure fails the readdir.
    async fn prime_stats(&self, prefix: &str, entries: &[ChildEntry]) -> StoreResult<()> {
        let mut missing: Vec<String> = Vec::new();
        for entry in entries {
            if entry.synthetic {
                continue; // pinned: always cached
            }
            let child_key = self.child_key(prefix, entry);
            match self.stats.get(&child_key, false, entry.etag.as_deref()) {
                Lookup::Hit(_) | Lookup::Negative => {}
                Lookup::Miss => missing.push(child_key),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let cancel = CancelFlag::new();
        let mut set: JoinSet<(String, StoreResult<Meta>)> = JoinSet::new();
        for child_key in missing {
            let store = Arc::clone(&self.store);
            let retry = self.config.retry;
            let cancel = cancel.clone();
            self.pool.spawn_on(&mut set, async move {
                let result = with_retries(&retry, &cancel, "readdir head", || {
                    store.head(&child_key)
                })
                .await;
                (child_key, result)
            });
        }

        let mut first = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((child_key, Ok(meta))) => {
                    self.stats.put(&child_key, &meta, false, false);
                }
                Ok((child_key, Err(StoreError::NotFound))) => {
                    debug!(key = %child_key, "listed child vanished before HEAD");
                }
                Ok((_, Err(e))) => {
                    cancel.cancel();
                    first.get_or_insert(e);
                }
                Err(join_err) => {
                    first.get_or_insert(StoreError::ClientFatal(format!(
                        "head task died: {join_err}"
                    )));
                }
            }
        }
        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // directories
    // ------------------------------------------------------------------

    /// Create a `key/` marker object typed as a directory.
    #[instrument(skip(self))]
    pub async fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> StoreResult<()> {
        let key = Self::key_of(path);
        if key.is_empty() {
            return Err(errno_err(libc::EEXIST));
        }
        let dir_key = format!("{key}/");
        let now = epoch_string(SystemTime::now());

        let mut meta = Meta::new();
        meta.insert("Content-Type", DIR_CONTENT_TYPE);
        meta.insert("x-amz-meta-mode", (libc::S_IFDIR | mode).to_string());
        meta.insert("x-amz-meta-uid", uid.to_string());
        meta.insert("x-amz-meta-gid", gid.to_string());
        meta.insert("x-amz-meta-mtime", now.clone());
        meta.insert("x-amz-meta-ctime", now);

        let cancel = CancelFlag::new();
        with_retries(&self.config.retry, &cancel, "mkdir", || {
            self.store.put(&dir_key, Bytes::new(), &meta)
        })
        .await?;

        self.stats.invalidate(key); // clear any negative entry
        self.stats.put(&dir_key, &meta, false, false);
        Ok(())
    }

    /// Remove an empty directory marker (all spellings).
    #[instrument(skip(self))]
    pub async fn rmdir(&self, path: &str) -> StoreResult<()> {
        let key = Self::key_of(path);
        if key.is_empty() {
            return Err(errno_err(libc::EBUSY));
        }
        let dir_key = format!("{key}/");

        let page = self.store.list(&dir_key, true, None).await?;
        let occupied = page
            .entries
            .iter()
            .any(|e| e.key != dir_key && !e.key.is_empty())
            || !page.common_prefixes.is_empty();
        if occupied {
            return Err(errno_err(libc::ENOTEMPTY));
        }

        for marker in [dir_key.clone(), format!("{key}{FOLDER_SUFFIX}")] {
            match self.store.delete(&marker).await {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        self.stats.invalidate(key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // files
    // ------------------------------------------------------------------

    /// Open an existing object.
    pub async fn open(&self, path: &str, truncate: bool) -> StoreResult<OpenHandle> {
        let key = Self::key_of(path);
        self.fds
            .open(key, OpenOptions {
                create: false,
                truncate,
                create_meta: Meta::new(),
            })
            .await
    }

    /// Create and open a new object. The file becomes visible to `readdir`
    /// and `getattr` immediately via a pinned stat-cache entry, although it
    /// is uploaded only on flush.
    #[instrument(skip(self))]
    pub async fn create(&self, path: &str, mode: u32, uid: u32, gid: u32) -> StoreResult<OpenHandle> {
        let key = Self::key_of(path);
        let now = epoch_string(SystemTime::now());

        let mut meta = Meta::new();
        meta.insert("Content-Type", "application/octet-stream");
        meta.insert("Content-Length", "0");
        meta.insert("x-amz-meta-mode", (libc::S_IFREG | mode).to_string());
        meta.insert("x-amz-meta-uid", uid.to_string());
        meta.insert("x-amz-meta-gid", gid.to_string());
        meta.insert("x-amz-meta-mtime", now.clone());
        meta.insert("x-amz-meta-ctime", now);

        self.fds
            .open(key, OpenOptions {
                create: true,
                truncate: true,
                create_meta: meta,
            })
            .await
    }

    pub async fn read(&self, handle: &OpenHandle, offset: u64, len: u32) -> StoreResult<Bytes> {
        self.fds.read(handle, offset, len).await
    }

    pub async fn write(&self, handle: &OpenHandle, offset: u64, data: &[u8]) -> StoreResult<usize> {
        self.fds.write(handle, offset, data).await
    }

    pub async fn flush(&self, handle: &OpenHandle) -> StoreResult<()> {
        self.fds.flush(handle).await
    }

    /// `fsync` has the same durability contract as flush here.
    pub async fn fsync(&self, handle: &OpenHandle) -> StoreResult<()> {
        self.fds.flush(handle).await
    }

    pub async fn release(&self, handle: &OpenHandle) -> StoreResult<()> {
        self.fds.release(handle).await
    }

    /// Truncate through the open entity when there is one; otherwise open a
    /// temporary entity, resize and flush it. A shrink of a closed large
    /// object uploads no data: the flush partitions into copy parts only.
    #[instrument(skip(self))]
    pub async fn truncate(&self, path: &str, new_size: u64) -> StoreResult<()> {
        let key = Self::key_of(path);
        if self.fds.truncate_open(key, new_size)? {
            let mut patch = Meta::new();
            patch.insert("Content-Length", new_size.to_string());
            self.stats.update_meta(key, &patch);
            return Ok(());
        }

        let handle = self.open(path, false).await?;
        let result = async {
            self.fds.truncate_open(key, new_size)?;
            self.fds.flush(&handle).await
        }
        .await;
        let released = self.fds.release(&handle).await;
        result?;
        released?;

        let mut patch = Meta::new();
        patch.insert("Content-Length", new_size.to_string());
        self.stats.update_meta(key, &patch);
        Ok(())
    }

    /// Remove an object and its cache footprint.
    #[instrument(skip(self))]
    pub async fn unlink(&self, path: &str) -> StoreResult<()> {
        let key = Self::key_of(path);
        let cancel = CancelFlag::new();
        with_retries(&self.config.retry, &cancel, "delete", || {
            self.store.delete(key)
        })
        .await?;
        self.stats.invalidate(key);
        self.symlinks.remove(key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // symlinks
    // ------------------------------------------------------------------

    /// Store a symlink: a regular object whose body is the target and whose
    /// mode metadata carries `S_IFLNK`.
    #[instrument(skip(self))]
    pub async fn symlink(&self, target: &str, path: &str, uid: u32, gid: u32) -> StoreResult<()> {
        let key = Self::key_of(path);
        let now = epoch_string(SystemTime::now());

        let mut meta = Meta::new();
        meta.insert("Content-Type", "application/octet-stream");
        meta.insert("Content-Length", target.len().to_string());
        meta.insert(
            "x-amz-meta-mode",
            (libc::S_IFLNK | 0o777).to_string(),
        );
        meta.insert("x-amz-meta-uid", uid.to_string());
        meta.insert("x-amz-meta-gid", gid.to_string());
        meta.insert("x-amz-meta-mtime", now.clone());
        meta.insert("x-amz-meta-ctime", now);

        let body = Bytes::copy_from_slice(target.as_bytes());
        let cancel = CancelFlag::new();
        with_retries(&self.config.retry, &cancel, "symlink put", || {
            self.store.put(key, body.clone(), &meta)
        })
        .await?;

        self.stats.invalidate(key);
        self.stats.put(key, &meta, false, false);
        self.symlinks.put(key, target);
        Ok(())
    }

    /// Resolve a symlink target, cached separately from stats.
    #[instrument(skip(self))]
    pub async fn readlink(&self, path: &str) -> StoreResult<String> {
        let key = Self::key_of(path);
        if let Some(target) = self.symlinks.get(key) {
            return Ok(target);
        }

        let stat = self.getattr(path).await?;
        if !stat.is_symlink() {
            return Err(errno_err(libc::EINVAL));
        }
        let cancel = CancelFlag::new();
        let body = with_retries(&self.config.retry, &cancel, "readlink get", || {
            self.store.get_range(key, ByteRange::new(0, stat.size))
        })
        .await?;
        let target = String::from_utf8(body.to_vec())
            .map_err(|_| StoreError::Integrity("symlink target is not UTF-8".into()))?;
        self.symlinks.put(key, &target);
        Ok(target)
    }

    // ------------------------------------------------------------------
    // rename / metadata
    // ------------------------------------------------------------------

    /// Rename: server-side copy + delete. Dirty open files are flushed
    /// first so the copy source is current. Directories rename descendant
    /// by descendant with no cross-object atomicity.
    #[instrument(skip(self))]
    pub async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let stat = self.getattr(from).await?;
        if stat.is_dir() {
            return self.rename_dir(from, to).await;
        }

        let from_key = Self::key_of(from).to_owned();
        let to_key = Self::key_of(to).to_owned();

        // The copy source must reflect local writes.
        self.fds.flush_key(&from_key).await?;

        let snap_meta = match self.stats.get(&from_key, false, None) {
            Lookup::Hit(snap) => snap.meta,
            _ => self.store.head(&from_key).await?,
        };

        let cancel = CancelFlag::new();
        with_retries(&self.config.retry, &cancel, "rename copy", || {
            self.store.put_copy(&from_key, &to_key, &snap_meta)
        })
        .await?;
        with_retries(&self.config.retry, &cancel, "rename delete", || {
            self.store.delete(&from_key)
        })
        .await?;

        self.stats.invalidate(&from_key);
        self.stats.invalidate(&to_key);
        self.stats.put(&to_key, &snap_meta, false, false);
        if let Some(target) = self.symlinks.get(&from_key) {
            self.symlinks.remove(&from_key);
            self.symlinks.put(&to_key, &target);
        }
        Ok(())
    }

    /// Per-descendant copy + delete in listing order. A mid-stream failure
    /// leaves a half-renamed tree; that is a property of the substrate, not
    /// something this layer can patch over.
    async fn rename_dir(&self, from: &str, to: &str) -> StoreResult<()> {
        let from_prefix = Self::dir_prefix(Self::key_of(from));
        let to_prefix = Self::dir_prefix(Self::key_of(to));
        if from_prefix.is_empty() || to_prefix.is_empty() {
            return Err(errno_err(libc::EBUSY));
        }

        // Collect every descendant, markers included (undelimited listing).
        let mut keys: Vec<String> = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .store
                .list(&from_prefix, false, token.as_deref())
                .await?;
            keys.extend(page.entries.iter().map(|e| e.key.clone()));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        // The marker of the directory itself may not be listed under its
        // own prefix on every server; move it explicitly.
        if !keys.contains(&from_prefix) && self.store.head(&from_prefix).await.is_ok() {
            keys.push(from_prefix.clone());
        }

        let cancel = CancelFlag::new();
        for key in keys {
            let suffix = key
                .strip_prefix(from_prefix.as_str())
                .unwrap_or(&key)
                .to_owned();
            let dst = if key == from_prefix {
                to_prefix.clone()
            } else {
                format!("{to_prefix}{suffix}")
            };
            let meta = self.store.head(&key).await?;
            with_retries(&self.config.retry, &cancel, "rename-dir copy", || {
                self.store.put_copy(&key, &dst, &meta)
            })
            .await?;
            with_retries(&self.config.retry, &cancel, "rename-dir delete", || {
                self.store.delete(&key)
            })
            .await?;
            self.stats.invalidate(&key);
            self.symlinks.remove(&key);
        }
        self.stats.invalidate(Self::key_of(from));
        self.stats.invalidate(Self::key_of(to));
        Ok(())
    }

    /// Apply a metadata patch (mode/owner/times) as a metadata-only
    /// server-side copy, or cache-only for objects that do not exist
    /// remotely yet (pinned files, implicit directories).
    async fn set_meta(&self, path: &str, patch: Meta) -> StoreResult<()> {
        let key = Self::key_of(path);
        if key.is_empty() {
            return Err(errno_err(libc::EPERM));
        }
        let stat = self.getattr(path).await?;

        // Find the storage spelling: the file key or the directory marker.
        let storage_key = if stat.is_dir() {
            format!("{key}/")
        } else {
            key.to_owned()
        };

        // A file that has not been uploaded yet has no remote object to
        // copy; the pinned cache entry (and the entity headers) carry the
        // change until the first flush.
        let pending_locally = self
            .fds
            .entity(key)
            .is_some_and(|e| {
                let mut inner = e.lock();
                inner.meta.merge_update(&patch);
                inner.pinned
            });
        if pending_locally {
            self.stats.update_meta(key, &patch);
            return Ok(());
        }

        let current = match self.store.head(&storage_key).await {
            Ok(meta) => meta,
            Err(StoreError::NotFound) if stat.is_dir() => {
                // Implicit directory: nothing stored, cache-only update.
                self.stats.update_meta(&storage_key, &patch);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut merged = current.curated();
        merged.merge_update(&patch);
        let now = epoch_string(SystemTime::now());
        merged.insert("x-amz-meta-ctime", now);

        let cancel = CancelFlag::new();
        with_retries(&self.config.retry, &cancel, "meta copy", || {
            self.store.put_copy(&storage_key, &storage_key, &merged)
        })
        .await?;

        self.stats.update_meta(&storage_key, &patch);
        self.stats.update_meta(key, &patch);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn chmod(&self, path: &str, mode: u32) -> StoreResult<()> {
        let stat = self.getattr(path).await?;
        let mut patch = Meta::new();
        patch.insert(
            "x-amz-meta-mode",
            ((stat.mode & libc::S_IFMT) | (mode & !libc::S_IFMT)).to_string(),
        );
        self.set_meta(path, patch).await
    }

    #[instrument(skip(self))]
    pub async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> StoreResult<()> {
        let mut patch = Meta::new();
        if let Some(uid) = uid {
            patch.insert("x-amz-meta-uid", uid.to_string());
        }
        if let Some(gid) = gid {
            patch.insert("x-amz-meta-gid", gid.to_string());
        }
        if patch.is_empty() {
            return Ok(());
        }
        self.set_meta(path, patch).await
    }

    #[instrument(skip(self))]
    pub async fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> StoreResult<()> {
        let mut patch = Meta::new();
        if let Some(atime) = atime {
            patch.insert("x-amz-meta-atime", epoch_string(atime));
        }
        if let Some(mtime) = mtime {
            patch.insert("x-amz-meta-mtime", epoch_string(mtime));
        }
        if patch.is_empty() {
            return Ok(());
        }
        self.set_meta(path, patch).await
    }

    /// Flush every dirty entity; called on unmount and SIGINT.
    pub async fn shutdown(&self) -> StoreResult<()> {
        if let Err(e) = self.fds.flush_all().await {
            warn!(error = %e, "shutdown flush incomplete");
            return Err(e);
        }
        Ok(())
    }
}
