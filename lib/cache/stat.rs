//! Bounded cache of object metadata and negative lookups.
//!
//! Entries are keyed by full path. A positive entry carries the derived
//! stat and the curated header subset; a negative entry records a confirmed
//! 404 so repeated lookups of missing paths stay local. Entries expire on a
//! monotonic clock and are evicted oldest-and-coldest-first when the cache
//! overflows. A pinned entry (open file that has not been uploaded yet) is
//! immune to both expiry and eviction, and its file name is registered
//! under its parent so `readdir` can surface it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::meta::{FileStat, Meta, mode_of, stat_from_meta};

/// How `expire` is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryMode {
    /// An entry expires `expire` after insertion.
    #[default]
    Fixed,
    /// Every successful `get` restarts the clock.
    Sliding,
}

#[derive(Debug, Clone)]
pub struct StatCacheConfig {
    /// Maximum number of non-pinned entries.
    pub capacity: usize,
    /// Entry lifetime; `None` disables expiry.
    pub expire: Option<Duration>,
    pub expiry_mode: ExpiryMode,
    /// Whether confirmed 404s are cached.
    pub negative_cache: bool,
}

impl Default for StatCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            expire: Some(Duration::from_secs(15 * 60)),
            expiry_mode: ExpiryMode::Fixed,
            negative_cache: true,
        }
    }
}

/// A copy of a positive cache entry handed to callers.
#[derive(Debug, Clone)]
pub struct StatSnapshot {
    pub stat: FileStat,
    pub meta: Meta,
    /// The entry was inserted as a directory regardless of its metadata
    /// (e.g. an implicit prefix with no marker object).
    pub forced_dir: bool,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(StatSnapshot),
    /// The path is known not to exist.
    Negative,
    Miss,
}

#[derive(Debug)]
struct Entry {
    stat: FileStat,
    meta: Meta,
    hit_count: u64,
    cache_date: Instant,
    forced_dir: bool,
    negative: bool,
    pin_count: u32,
}

impl Entry {
    fn expired(&self, expire: Option<Duration>, now: Instant) -> bool {
        if self.pin_count > 0 {
            return false;
        }
        expire.is_some_and(|e| now.duration_since(self.cache_date) > e)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Parent directory (with trailing `/`) to pinned child file names.
    pinned_children: HashMap<String, Vec<String>>,
}

/// Process-wide stat cache. One mutex, never held across I/O.
pub struct StatCache {
    config: StatCacheConfig,
    inner: Mutex<Inner>,
}

fn split_parent(key: &str) -> Option<(String, String)> {
    let trimmed = key.strip_suffix('/').unwrap_or(key);
    let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
    if name.is_empty() {
        return None;
    }
    Some((format!("{parent}/"), name.to_owned()))
}

/// The `/`-toggled variant of a key: `a/b` <-> `a/b/`.
fn slash_variant(key: &str) -> Option<String> {
    if key.is_empty() || key == "/" {
        return None;
    }
    Some(match key.strip_suffix('/') {
        Some(stripped) => stripped.to_owned(),
        None => format!("{key}/"),
    })
}

impl StatCache {
    pub fn new(config: StatCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Look up `key`.
    ///
    /// With `overcheck` and a key not ending in `/`, the directory variant
    /// `key/` is tried first. A cached entry whose ETag differs from
    /// `expected_etag` evicts itself and reports a miss, so a caller holding
    /// a fresh listing invalidates stale metadata for free.
    pub fn get(&self, key: &str, overcheck: bool, expected_etag: Option<&str>) -> Lookup {
        let now = Instant::now();
        let mut inner = self.lock();

        let mut path = None;
        if overcheck && !key.ends_with('/') {
            let dir = format!("{key}/");
            if inner.entries.contains_key(&dir) {
                path = Some(dir);
            }
        }
        let path = match path {
            Some(p) => p,
            None if inner.entries.contains_key(key) => key.to_owned(),
            None => return Lookup::Miss,
        };

        let entry = inner
            .entries
            .get(&path)
            .unwrap_or_else(|| unreachable!("presence checked above"));

        if entry.expired(self.config.expire, now) {
            trace!(key = %path, "stat cache entry expired");
            Self::remove_locked(&mut inner, &path);
            return Lookup::Miss;
        }

        if entry.negative {
            if !self.config.negative_cache {
                Self::remove_locked(&mut inner, &path);
                return Lookup::Miss;
            }
            return Lookup::Negative;
        }

        if let Some(expected) = expected_etag
            && let Some(cached) = entry.meta.etag()
            && cached != expected.trim_matches('"')
        {
            debug!(key = %path, "stat cache self-evict on etag mismatch");
            Self::remove_locked(&mut inner, &path);
            return Lookup::Miss;
        }

        let entry = inner
            .entries
            .get_mut(&path)
            .unwrap_or_else(|| unreachable!("presence checked above"));
        entry.hit_count += 1;
        if self.config.expiry_mode == ExpiryMode::Sliding {
            entry.cache_date = now;
        }
        Lookup::Hit(StatSnapshot {
            stat: entry.stat,
            meta: entry.meta.clone(),
            forced_dir: entry.forced_dir,
        })
    }

    /// Insert a positive entry for `key`, evicting any stale variant and
    /// truncating the cache if it is full.
    ///
    /// With `pin`, the entry starts with `pin_count = 1` and the file name
    /// is registered under its parent for `readdir` augmentation.
    pub fn put(&self, key: &str, meta: &Meta, forced_dir: bool, pin: bool) {
        if self.config.capacity == 0 && !pin {
            return;
        }
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            Self::remove_locked(&mut inner, key);
        } else {
            self.truncate_locked(&mut inner, true);
        }

        let curated = meta.curated();
        let entry = Entry {
            stat: stat_from_meta(key, &curated, forced_dir),
            meta: curated,
            hit_count: 0,
            cache_date: Instant::now(),
            forced_dir,
            negative: false,
            pin_count: u32::from(pin),
        };
        trace!(%key, pin, "stat cache insert");
        inner.entries.insert(key.to_owned(), entry);
        if pin && let Some((parent, name)) = split_parent(key) {
            let children = inner.pinned_children.entry(parent).or_default();
            if !children.contains(&name) {
                children.push(name);
            }
        }
    }

    /// Record a confirmed 404 for `key`. No-op when negative caching is off.
    pub fn put_negative(&self, key: &str) {
        if !self.config.negative_cache || self.config.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            Self::remove_locked(&mut inner, key);
        } else {
            self.truncate_locked(&mut inner, true);
        }
        trace!(%key, "negative cache insert");
        inner.entries.insert(key.to_owned(), Entry {
            stat: stat_from_meta(key, &Meta::new(), false),
            meta: Meta::new(),
            hit_count: 0,
            cache_date: Instant::now(),
            forced_dir: false,
            negative: true,
            pin_count: 0,
        });
    }

    /// Merge a curated-header patch into an existing entry, refresh its
    /// timestamp and re-derive the mode. Missing entries are ignored.
    pub fn update_meta(&self, key: &str, patch: &Meta) {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        if entry.negative {
            return;
        }
        entry.meta.merge_update(patch);
        entry.cache_date = Instant::now();
        entry.stat = stat_from_meta(key, &entry.meta, entry.forced_dir);
        // The mode may change while the file is open.
        entry.stat.mode = mode_of(&entry.meta, key, entry.forced_dir);
    }

    /// Raise the pin count of an existing entry, registering it under its
    /// parent on the first pin.
    pub fn pin(&self, key: &str) {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        entry.pin_count += 1;
        if entry.pin_count == 1
            && let Some((parent, name)) = split_parent(key)
        {
            let children = inner.pinned_children.entry(parent).or_default();
            if !children.contains(&name) {
                children.push(name);
            }
        }
    }

    /// Drop one pin; at zero the entry becomes evictable and leaves the
    /// pinned-children index.
    pub fn unpin(&self, key: &str) {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        if entry.pin_count == 0 {
            return;
        }
        entry.pin_count -= 1;
        if entry.pin_count == 0 {
            Self::deregister_pin(&mut inner, key);
        }
    }

    /// Remove `key` and its `/`-variant.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.lock();
        Self::remove_locked(&mut inner, key);
    }

    /// Pinned child file names under `parent` (with or without trailing
    /// `/`); used by `readdir` to include files that exist in the namespace
    /// but have not been uploaded yet.
    pub fn list_pinned(&self, parent: &str) -> Vec<String> {
        let dirpath = if parent.ends_with('/') {
            parent.to_owned()
        } else {
            format!("{parent}/")
        };
        self.lock()
            .pinned_children
            .get(&dirpath)
            .cloned()
            .unwrap_or_default()
    }

    fn remove_locked(inner: &mut Inner, key: &str) {
        if inner.entries.remove(key).is_some() {
            Self::deregister_pin(inner, key);
        }
        if let Some(variant) = slash_variant(key)
            && inner.entries.remove(&variant).is_some()
        {
            Self::deregister_pin(inner, &variant);
        }
    }

    fn deregister_pin(inner: &mut Inner, key: &str) {
        let Some((parent, name)) = split_parent(key) else {
            return;
        };
        if let Some(children) = inner.pinned_children.get_mut(&parent) {
            children.retain(|c| c != &name);
            if children.is_empty() {
                inner.pinned_children.remove(&parent);
            }
        }
    }

    /// Make room: sweep expired non-pinned entries, then if the cache is
    /// still at capacity evict non-pinned entries ascending by
    /// `(cache_date, hit_count)` until one slot is free.
    ///
    /// With `oversize_only`, returns immediately while below capacity.
    fn truncate_locked(&self, inner: &mut Inner, oversize_only: bool) {
        if inner.entries.is_empty() || (oversize_only && inner.entries.len() < self.config.capacity)
        {
            return;
        }

        let now = Instant::now();
        if self.config.expire.is_some() {
            let expire = self.config.expire;
            let expired: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.expired(expire, now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                Self::remove_locked(inner, &key);
            }
        }

        if inner.entries.len() < self.config.capacity {
            return;
        }

        let mut excess = inner.entries.len() - self.config.capacity + 1;
        let mut victims: Vec<(Instant, u64, String)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.pin_count == 0)
            .map(|(k, e)| (e.cache_date, e.hit_count, k.clone()))
            .collect();
        victims.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        victims.truncate(excess.min(victims.len()));
        for (_, _, key) in victims {
            debug!(key = %key, "stat cache eviction");
            Self::remove_locked(inner, &key);
            excess = excess.saturating_sub(1);
            if excess == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_meta(size: u64) -> Meta {
        let mut m = Meta::new();
        m.insert("Content-Type", "application/octet-stream");
        m.insert("Content-Length", size.to_string());
        m.insert("ETag", "\"etag-1\"");
        m
    }

    fn small_cache(capacity: usize) -> StatCache {
        StatCache::new(StatCacheConfig {
            capacity,
            expire: Some(Duration::from_secs(3600)),
            expiry_mode: ExpiryMode::Fixed,
            negative_cache: true,
        })
    }

    #[test]
    fn put_then_get_hits() {
        let cache = small_cache(10);
        cache.put("a/b", &file_meta(7), false, false);
        match cache.get("a/b", false, None) {
            Lookup::Hit(snap) => assert_eq!(snap.stat.size, 7),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn get_missing_is_miss() {
        let cache = small_cache(10);
        assert!(matches!(cache.get("nope", false, None), Lookup::Miss));
    }

    #[test]
    fn overcheck_prefers_directory_variant() {
        let cache = small_cache(10);
        let mut dir = Meta::new();
        dir.insert("Content-Type", "application/x-directory");
        cache.put("a/d/", &dir, false, false);
        match cache.get("a/d", true, None) {
            Lookup::Hit(snap) => assert!(snap.stat.is_dir()),
            other => panic!("expected dir hit, got {other:?}"),
        }
        // Without overcheck the bare key misses.
        assert!(matches!(cache.get("a/d", false, None), Lookup::Miss));
    }

    #[test]
    fn etag_mismatch_self_evicts() {
        let cache = small_cache(10);
        cache.put("k", &file_meta(1), false, false);
        assert!(matches!(
            cache.get("k", false, Some("etag-1")),
            Lookup::Hit(_)
        ));
        assert!(matches!(
            cache.get("k", false, Some("other-etag")),
            Lookup::Miss
        ));
        // Entry is gone now.
        assert!(matches!(cache.get("k", false, None), Lookup::Miss));
    }

    #[test]
    fn negative_entry_roundtrip() {
        let cache = small_cache(10);
        cache.put_negative("gone");
        assert!(matches!(cache.get("gone", false, None), Lookup::Negative));
        cache.invalidate("gone");
        assert!(matches!(cache.get("gone", false, None), Lookup::Miss));
    }

    #[test]
    fn negative_cache_disabled_is_noop() {
        let cache = StatCache::new(StatCacheConfig {
            negative_cache: false,
            ..StatCacheConfig::default()
        });
        cache.put_negative("gone");
        assert!(matches!(cache.get("gone", false, None), Lookup::Miss));
    }

    #[test]
    fn expiry_evicts_on_get() {
        let cache = StatCache::new(StatCacheConfig {
            capacity: 10,
            expire: Some(Duration::ZERO),
            expiry_mode: ExpiryMode::Fixed,
            negative_cache: true,
        });
        cache.put("k", &file_meta(1), false, false);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(cache.get("k", false, None), Lookup::Miss));
        assert!(cache.is_empty(), "expired entry should be evicted");
    }

    #[test]
    fn pinned_entry_never_expires() {
        let cache = StatCache::new(StatCacheConfig {
            capacity: 10,
            expire: Some(Duration::ZERO),
            expiry_mode: ExpiryMode::Fixed,
            negative_cache: true,
        });
        cache.put("dir/pending", &file_meta(0), false, true);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            cache.get("dir/pending", false, None),
            Lookup::Hit(_)
        ));
    }

    #[test]
    fn capacity_eviction_prefers_cold_entries() {
        let cache = small_cache(3);
        cache.put("a", &file_meta(1), false, false);
        cache.put("b", &file_meta(1), false, false);
        cache.put("c", &file_meta(1), false, false);
        // Heat up "a" so its hit count exceeds the others.
        let _ = cache.get("a", false, None);
        let _ = cache.get("a", false, None);

        cache.put("d", &file_meta(1), false, false);
        assert!(cache.len() <= 3);
        assert!(
            matches!(cache.get("a", false, None), Lookup::Hit(_)),
            "hot entry should survive"
        );
        assert!(matches!(cache.get("d", false, None), Lookup::Hit(_)));
    }

    // Invariant 5: pinned entries survive arbitrary put pressure and the
    // non-pinned population stays bounded.
    #[test]
    fn pins_survive_put_pressure() {
        let cache = small_cache(5);
        cache.put("dir/pinned", &file_meta(0), false, true);
        for i in 0..20 {
            cache.put(&format!("f{i}"), &file_meta(1), false, false);
        }
        assert!(matches!(
            cache.get("dir/pinned", false, None),
            Lookup::Hit(_)
        ));
        assert!(cache.len() <= 5 + 1, "capacity + pinned");
    }

    #[test]
    fn pinned_children_listing() {
        let cache = small_cache(10);
        cache.put("dir/a", &file_meta(0), false, true);
        cache.put("dir/b", &file_meta(0), false, true);
        cache.put("dir/c", &file_meta(0), false, false);
        let mut names = cache.list_pinned("dir");
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(cache.list_pinned("dir/"), cache.list_pinned("dir"));

        cache.unpin("dir/a");
        assert_eq!(cache.list_pinned("dir"), vec!["b"]);
    }

    #[test]
    fn unpin_makes_entry_evictable() {
        let cache = StatCache::new(StatCacheConfig {
            capacity: 10,
            expire: Some(Duration::ZERO),
            expiry_mode: ExpiryMode::Fixed,
            negative_cache: true,
        });
        cache.put("dir/f", &file_meta(0), false, true);
        cache.unpin("dir/f");
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(cache.get("dir/f", false, None), Lookup::Miss));
    }

    #[test]
    fn invalidate_removes_both_variants() {
        let cache = small_cache(10);
        cache.put("x", &file_meta(1), false, false);
        let mut dir = Meta::new();
        dir.insert("Content-Type", "application/x-directory");
        cache.put("x/", &dir, false, false);
        cache.invalidate("x");
        assert!(cache.is_empty());
    }

    #[test]
    fn update_meta_merges_and_redrives_mode() {
        let cache = small_cache(10);
        cache.put("f", &file_meta(9), false, false);
        let mut patch = Meta::new();
        patch.insert("x-amz-meta-mode", (libc::S_IFREG | 0o600).to_string());
        patch.insert("x-amz-meta-uid", "42");
        cache.update_meta("f", &patch);
        match cache.get("f", false, None) {
            Lookup::Hit(snap) => {
                assert_eq!(snap.stat.mode & 0o777, 0o600);
                assert_eq!(snap.stat.uid, 42);
                assert_eq!(snap.stat.size, 9, "untouched headers survive");
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn sliding_expiry_refreshes_on_get() {
        let cache = StatCache::new(StatCacheConfig {
            capacity: 10,
            expire: Some(Duration::from_millis(30)),
            expiry_mode: ExpiryMode::Sliding,
            negative_cache: true,
        });
        cache.put("k", &file_meta(1), false, false);
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(15));
            assert!(
                matches!(cache.get("k", false, None), Lookup::Hit(_)),
                "sliding get should keep the entry alive"
            );
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(cache.get("k", false, None), Lookup::Miss));
    }
}
