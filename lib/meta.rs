//! Object metadata: a case-insensitive, case-preserving header map and the
//! conversions from headers to POSIX file attributes.
//!
//! Header names are matched case-insensitively on lookup but re-emitted with
//! their original spelling. Some servers echo header names verbatim, so the
//! spelling an object was stored with must survive a round-trip through the
//! cache.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Directory marker content type written by this implementation.
pub const DIR_CONTENT_TYPE: &str = "application/x-directory";

/// Legacy directory marker suffix accepted on read.
pub const FOLDER_SUFFIX: &str = "_$folder$";

/// A header name that compares and hashes ASCII-case-insensitively while
/// remembering its original spelling.
#[derive(Debug, Clone, Eq)]
pub struct MetaKey(String);

impl MetaKey {
    /// The original spelling of the header name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for MetaKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl PartialOrd for MetaKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetaKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.0.as_bytes().iter().map(u8::to_ascii_lowercase);
        let b = other.0.as_bytes().iter().map(u8::to_ascii_lowercase);
        a.cmp(b)
    }
}

impl From<&str> for MetaKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Case-insensitive header map preserving original key spelling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    entries: BTreeMap<MetaKey, String>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a header value by case-insensitive name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&MetaKey::from(name))
            .map(String::as_str)
    }

    /// Insert a header, replacing any entry whose name matches
    /// case-insensitively. The new spelling wins.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let key = MetaKey(name.into());
        self.entries.remove(&key);
        self.entries.insert(key, value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&MetaKey::from(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&MetaKey::from(name))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate `(original_name, value)` pairs in case-insensitive name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether this header name belongs to the curated subset the cache
    /// persists and re-emits: `content-type`, `content-length`, `etag`,
    /// `last-modified` and anything under the `x-amz` prefix.
    pub fn is_curated(name: &str) -> bool {
        name.eq_ignore_ascii_case("content-type")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("etag")
            || name.eq_ignore_ascii_case("last-modified")
            || name
                .get(..5)
                .is_some_and(|p| p.eq_ignore_ascii_case("x-amz"))
    }

    /// Return a copy containing only the curated header subset.
    pub fn curated(&self) -> Meta {
        let mut out = Meta::new();
        for (name, value) in self.iter() {
            if Self::is_curated(name) {
                out.insert(name, value);
            }
        }
        out
    }

    /// Apply a metadata patch: curated keys are overwritten, an empty value
    /// deletes the corresponding header, non-curated keys are ignored.
    pub fn merge_update(&mut self, patch: &Meta) {
        for (name, value) in patch.iter() {
            if value.is_empty() {
                self.remove(name);
            } else if Self::is_curated(name) {
                self.insert(name, value);
            }
        }
    }

    /// ETag with surrounding quotes stripped, if present.
    pub fn etag(&self) -> Option<&str> {
        self.get("etag").map(|e| e.trim_matches('"'))
    }
}

impl FromIterator<(String, String)> for Meta {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut meta = Meta::new();
        for (k, v) in iter {
            meta.insert(k, v);
        }
        meta
    }
}

/// POSIX attributes derived from object metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File type and permission bits (`st_mode`).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub atime: SystemTime,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

fn parse_epoch(value: &str) -> Option<SystemTime> {
    // "1700000000" or "1700000000.123456789"
    let (secs, frac) = match value.split_once('.') {
        Some((s, f)) => (s, f),
        None => (value, ""),
    };
    let secs: u64 = secs.parse().ok()?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        let mut digits = String::from(frac);
        digits.truncate(9);
        while digits.len() < 9 {
            digits.push('0');
        }
        digits.parse().ok()?
    };
    Some(UNIX_EPOCH + Duration::new(secs, nanos))
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    let dt = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let secs = u64::try_from(dt.timestamp()).ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

/// Modification time: `x-amz-meta-mtime` (epoch seconds, possibly
/// fractional) takes precedence over the server's `last-modified`.
pub fn mtime_of(meta: &Meta) -> SystemTime {
    meta.get("x-amz-meta-mtime")
        .and_then(parse_epoch)
        .or_else(|| meta.get("last-modified").and_then(parse_http_date))
        .unwrap_or(UNIX_EPOCH)
}

/// Change time, falling back to mtime when absent.
pub fn ctime_of(meta: &Meta) -> SystemTime {
    meta.get("x-amz-meta-ctime")
        .and_then(parse_epoch)
        .unwrap_or_else(|| mtime_of(meta))
}

/// Access time, falling back to mtime when absent.
pub fn atime_of(meta: &Meta) -> SystemTime {
    meta.get("x-amz-meta-atime")
        .and_then(parse_epoch)
        .unwrap_or_else(|| mtime_of(meta))
}

pub fn size_of(meta: &Meta) -> u64 {
    meta.get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn uid_of(meta: &Meta) -> Option<u32> {
    meta.get("x-amz-meta-uid").and_then(|v| v.parse().ok())
}

pub fn gid_of(meta: &Meta) -> Option<u32> {
    meta.get("x-amz-meta-gid").and_then(|v| v.parse().ok())
}

/// Whether the metadata marks the object as a directory: explicit mode bits,
/// a directory content type, or a key ending in `/`.
pub fn is_dir_meta(meta: &Meta, key: &str) -> bool {
    if let Some(mode) = raw_mode(meta)
        && mode & libc::S_IFMT == libc::S_IFDIR
    {
        return true;
    }
    if let Some(ct) = meta.get("content-type") {
        let ct = ct.split(';').next().unwrap_or(ct).trim();
        if ct == DIR_CONTENT_TYPE || ct == "httpd/unix-directory" {
            return true;
        }
    }
    key.ends_with('/')
}

/// Whether the metadata marks the object as a symbolic link.
pub fn is_symlink_meta(meta: &Meta) -> bool {
    raw_mode(meta).is_some_and(|m| m & libc::S_IFMT == libc::S_IFLNK)
}

fn raw_mode(meta: &Meta) -> Option<u32> {
    meta.get("x-amz-meta-mode").and_then(|v| v.parse().ok())
}

/// Effective `st_mode` for an object.
///
/// An explicit `x-amz-meta-mode` wins. Without one the type is inferred
/// from the content type and key shape, with default permissions 0755 for
/// directories and 0644 for files.
pub fn mode_of(meta: &Meta, key: &str, forced_dir: bool) -> u32 {
    if let Some(mut mode) = raw_mode(meta) {
        if mode & libc::S_IFMT == 0 {
            // Permission-only value stored by chmod; re-derive the type.
            mode |= if forced_dir || is_dir_meta(meta, key) {
                libc::S_IFDIR
            } else {
                libc::S_IFREG
            };
        }
        return mode;
    }
    if forced_dir || is_dir_meta(meta, key) {
        libc::S_IFDIR | 0o755
    } else {
        libc::S_IFREG | 0o644
    }
}

/// Derive the full stat from object metadata.
///
/// `forced_dir` marks keys known to be directories from the namespace (for
/// example an implicit prefix with children but no marker object).
pub fn stat_from_meta(key: &str, meta: &Meta, forced_dir: bool) -> FileStat {
    let mode = mode_of(meta, key, forced_dir);
    let size = if mode & libc::S_IFMT == libc::S_IFDIR {
        0
    } else {
        size_of(meta)
    };
    FileStat {
        mode,
        uid: uid_of(meta).unwrap_or(0),
        gid: gid_of(meta).unwrap_or(0),
        size,
        mtime: mtime_of(meta),
        ctime: ctime_of(meta),
        atime: atime_of(meta),
    }
}
