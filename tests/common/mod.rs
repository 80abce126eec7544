#![allow(dead_code, clippy::unwrap_used)]
//! Shared test fixtures: an in-memory scripted object store and an
//! [`ObjFs`] wired to it with test-sized tunables.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use objfs::ByteRange;
use objfs::cache::{StatCache, StatCacheConfig, SymlinkCache, SymlinkCacheConfig};
use objfs::error::{StoreError, StoreResult};
use objfs::fd::FdCacheConfig;
use objfs::fs::{ObjFs, ObjFsConfig};
use objfs::meta::Meta;
use objfs::pool::RequestPool;
use objfs::store::{ListEntry, ListPage, ObjectStore, PartList, RetryPolicy};

pub const MIB: u64 = 1024 * 1024;

/// Part size used by the test filesystem: the protocol floor, so multipart
/// scenarios stay small.
pub const PART: u64 = 5 * MIB;

/// Multipart threshold of the test filesystem.
pub const THRESHOLD: u64 = 10 * MIB;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

/// An [`ObjFs`] over the mock store with small part sizes and fast retries.
pub fn test_fs(store: &Arc<MockStore>, staging: &Path) -> ObjFs<MockStore> {
    test_fs_with_stat_config(store, staging, StatCacheConfig::default())
}

pub fn test_fs_with_stat_config(
    store: &Arc<MockStore>,
    staging: &Path,
    stat_config: StatCacheConfig,
) -> ObjFs<MockStore> {
    ObjFs::new(
        Arc::clone(store),
        RequestPool::new(8),
        Arc::new(StatCache::new(stat_config)),
        SymlinkCache::new(SymlinkCacheConfig::default()),
        FdCacheConfig {
            staging_dir: staging.to_path_buf(),
            part_size: PART,
            multipart_threshold: THRESHOLD,
            retry: fast_retry(),
        },
        ObjFsConfig {
            uid: 1000,
            gid: 1000,
            retry: fast_retry(),
        },
    )
}

/// Deterministic patterned bytes for content checks.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// One recorded store request, for traffic-shape assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Head(String),
    Get { key: String, offset: u64, len: u64 },
    Put { key: String, len: usize },
    Copy { src: String, dst: String },
    Delete(String),
    List { prefix: String, delimited: bool },
    Initiate(String),
    UploadPart { key: String, number: u32, len: usize },
    CopyPart { key: String, number: u32, offset: u64, len: u64 },
    Complete { key: String, parts: Vec<u32> },
    Abort(String),
}

#[derive(Debug, Clone)]
pub struct MockObject {
    pub body: Vec<u8>,
    pub meta: Meta,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    meta: Meta,
    parts: HashMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    objects: HashMap<String, MockObject>,
    uploads: HashMap<String, PendingUpload>,
    calls: Vec<Call>,
    /// Scripted failures per operation tag, consumed in order.
    failures: HashMap<String, VecDeque<StoreError>>,
    etag_counter: u64,
    /// Objects per listing page; tests lower this to force pagination.
    page_size: usize,
}

/// In-memory object store that records every request and can be scripted
/// to fail specific operations.
pub struct MockStore {
    state: Mutex<MockState>,
    next_upload: AtomicU32,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                page_size: 1_000,
                ..MockState::default()
            }),
            next_upload: AtomicU32::new(1),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Seed an object; computes `content-length` and a fresh etag.
    pub fn add_object(&self, key: &str, body: &[u8], extra: &[(&str, &str)]) {
        let mut state = self.lock();
        state.etag_counter += 1;
        let mut meta = Meta::new();
        meta.insert("Content-Type", "application/octet-stream");
        for (k, v) in extra {
            meta.insert(*k, *v);
        }
        meta.insert("Content-Length", body.len().to_string());
        meta.insert("ETag", format!("\"mock-{}\"", state.etag_counter));
        state.objects.insert(key.to_owned(), MockObject {
            body: body.to_vec(),
            meta,
        });
    }

    /// Seed a canonical directory marker.
    pub fn add_dir(&self, key: &str) {
        let marker = if key.ends_with('/') {
            key.to_owned()
        } else {
            format!("{key}/")
        };
        self.add_object(&marker, b"", &[("Content-Type", "application/x-directory")]);
    }

    pub fn object(&self, key: &str) -> Option<MockObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn has_object(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn set_page_size(&self, n: usize) {
        self.lock().page_size = n;
    }

    /// Script the next invocations of `tag` (e.g. `"upload_part:3"`,
    /// `"put"`, `"head"`) to fail with the given errors.
    pub fn fail_with(&self, tag: &str, errors: Vec<StoreError>) {
        self.lock()
            .failures
            .entry(tag.to_owned())
            .or_default()
            .extend(errors);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count_calls(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| f(c)).count()
    }

    fn check_failure(&self, tags: &[String]) -> StoreResult<()> {
        let mut state = self.lock();
        for tag in tags {
            if let Some(queue) = state.failures.get_mut(tag)
                && let Some(err) = queue.pop_front()
            {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl ObjectStore for MockStore {
    async fn head(&self, key: &str) -> StoreResult<Meta> {
        self.lock().calls.push(Call::Head(key.to_owned()));
        self.check_failure(&[format!("head:{key}"), "head".to_owned()])?;
        self.lock()
            .objects
            .get(key)
            .map(|o| o.meta.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn get_range(&self, key: &str, range: ByteRange) -> StoreResult<Bytes> {
        self.lock().calls.push(Call::Get {
            key: key.to_owned(),
            offset: range.offset,
            len: range.len,
        });
        self.check_failure(&[format!("get:{key}"), "get".to_owned()])?;
        let state = self.lock();
        let object = state.objects.get(key).ok_or(StoreError::NotFound)?;
        let start = usize::try_from(range.offset).unwrap().min(object.body.len());
        let end = usize::try_from(range.end()).unwrap().min(object.body.len());
        Ok(Bytes::copy_from_slice(&object.body[start..end]))
    }

    async fn put(&self, key: &str, body: Bytes, meta: &Meta) -> StoreResult<()> {
        self.lock().calls.push(Call::Put {
            key: key.to_owned(),
            len: body.len(),
        });
        self.check_failure(&[format!("put:{key}"), "put".to_owned()])?;
        let mut state = self.lock();
        state.etag_counter += 1;
        let mut stored = meta.curated();
        stored.insert("Content-Length", body.len().to_string());
        stored.insert("ETag", format!("\"mock-{}\"", state.etag_counter));
        state.objects.insert(key.to_owned(), MockObject {
            body: body.to_vec(),
            meta: stored,
        });
        Ok(())
    }

    async fn put_copy(&self, src: &str, dst: &str, meta: &Meta) -> StoreResult<()> {
        self.lock().calls.push(Call::Copy {
            src: src.to_owned(),
            dst: dst.to_owned(),
        });
        self.check_failure(&[format!("copy:{src}"), "copy".to_owned()])?;
        let mut state = self.lock();
        let body = state
            .objects
            .get(src)
            .ok_or(StoreError::NotFound)?
            .body
            .clone();
        state.etag_counter += 1;
        let mut stored = meta.curated();
        stored.insert("Content-Length", body.len().to_string());
        stored.insert("ETag", format!("\"mock-{}\"", state.etag_counter));
        state
            .objects
            .insert(dst.to_owned(), MockObject { body, meta: stored });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.lock().calls.push(Call::Delete(key.to_owned()));
        self.check_failure(&[format!("delete:{key}"), "delete".to_owned()])?;
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        token: Option<&str>,
    ) -> StoreResult<ListPage> {
        self.lock().calls.push(Call::List {
            prefix: prefix.to_owned(),
            delimited,
        });
        self.check_failure(&["list".to_owned()])?;
        let state = self.lock();

        let mut keys: Vec<&String> = state
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();

        let start = token.map_or(0, |t| t.parse().unwrap_or(0));
        let mut page = ListPage::default();
        let mut seen_prefixes: Vec<String> = Vec::new();
        let mut taken = 0;
        let mut consumed = 0;
        for key in keys.iter().skip(start) {
            if taken >= state.page_size {
                page.next_token = Some((start + consumed).to_string());
                break;
            }
            consumed += 1;
            let suffix = &key[prefix.len()..];
            if delimited && let Some(slash) = suffix.find('/') {
                // Roll up below the delimiter, marker objects excepted.
                if slash + 1 < suffix.len() {
                    let common = format!("{prefix}{}", &suffix[..=slash]);
                    if !seen_prefixes.contains(&common) {
                        seen_prefixes.push(common);
                    }
                    continue;
                }
            }
            let object = &state.objects[key.as_str()];
            page.entries.push(ListEntry {
                key: (*key).clone(),
                size: object.body.len() as u64,
                etag: object.meta.etag().map(str::to_owned),
            });
            taken += 1;
        }
        page.common_prefixes = seen_prefixes;
        Ok(page)
    }

    async fn initiate_multipart(&self, key: &str, meta: &Meta) -> StoreResult<String> {
        self.lock().calls.push(Call::Initiate(key.to_owned()));
        self.check_failure(&["initiate".to_owned()])?;
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.lock().uploads.insert(id.clone(), PendingUpload {
            key: key.to_owned(),
            meta: meta.curated(),
            parts: HashMap::new(),
        });
        Ok(id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<String> {
        self.lock().calls.push(Call::UploadPart {
            key: key.to_owned(),
            number: part_number,
            len: body.len(),
        });
        self.check_failure(&[
            format!("upload_part:{part_number}"),
            "upload_part".to_owned(),
        ])?;
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::ClientFatal("unknown upload id".into()))?;
        upload.parts.insert(part_number, body.to_vec());
        Ok(format!("\"part-{part_number}\""))
    }

    async fn copy_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src: &str,
        range: ByteRange,
    ) -> StoreResult<String> {
        self.lock().calls.push(Call::CopyPart {
            key: key.to_owned(),
            number: part_number,
            offset: range.offset,
            len: range.len,
        });
        self.check_failure(&[format!("copy_part:{part_number}"), "copy_part".to_owned()])?;
        let mut state = self.lock();
        let body = {
            let object = state.objects.get(src).ok_or(StoreError::NotFound)?;
            let start = usize::try_from(range.offset).unwrap().min(object.body.len());
            let end = usize::try_from(range.end()).unwrap().min(object.body.len());
            object.body[start..end].to_vec()
        };
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::ClientFatal("unknown upload id".into()))?;
        upload.parts.insert(part_number, body);
        Ok(format!("\"part-{part_number}\""))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &PartList,
    ) -> StoreResult<()> {
        self.lock().calls.push(Call::Complete {
            key: key.to_owned(),
            parts: parts.iter().map(|(n, _)| *n).collect(),
        });
        self.check_failure(&["complete".to_owned()])?;

        assert!(
            parts.windows(2).all(|w| w[0].0 < w[1].0),
            "complete must list parts in ascending part-number order"
        );

        let mut state = self.lock();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::ClientFatal("unknown upload id".into()))?;
        assert_eq!(upload.key, key, "complete must target the initiated key");

        let mut body = Vec::new();
        for (number, _etag) in parts {
            let part = upload
                .parts
                .get(number)
                .unwrap_or_else(|| panic!("part {number} was never uploaded"));
            body.extend_from_slice(part);
        }
        state.etag_counter += 1;
        let mut meta = upload.meta;
        meta.insert("Content-Length", body.len().to_string());
        meta.insert("ETag", format!("\"mock-{}\"", state.etag_counter));
        state
            .objects
            .insert(key.to_owned(), MockObject { body, meta });
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        self.lock().calls.push(Call::Abort(key.to_owned()));
        self.check_failure(&["abort".to_owned()])?;
        self.lock().uploads.remove(upload_id);
        Ok(())
    }
}
