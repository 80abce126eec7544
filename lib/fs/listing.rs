//! Directory listing normalization.
//!
//! The store admits several directory representations: a `key/` marker, a
//! zero-body `key`, the legacy `key_$folder$` marker, and an implicit
//! prefix with children but no marker at all. A listing folds all of them
//! into one child set keyed by plain name, with the directory form winning
//! over a same-named file form.

use std::collections::BTreeMap;

use crate::meta::FOLDER_SUFFIX;

/// One normalized directory child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    /// Plain name, no trailing slash.
    pub name: String,
    pub is_dir: bool,
    /// ETag from the listing, for stat-cache freshness checks.
    pub etag: Option<String>,
    pub size: u64,
    /// Present only in the namespace (pinned, not yet uploaded).
    pub synthetic: bool,
}

/// Accumulates raw listing output into a normalized child set.
#[derive(Debug, Default)]
pub struct ObjectList {
    children: BTreeMap<String, ChildEntry>,
}

impl ObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object row. `name` is the key suffix below the listed prefix;
    /// marker spellings are normalized here.
    pub fn insert_object(&mut self, name: &str, etag: Option<&str>, size: u64) {
        let (name, mut is_dir) = match name.strip_suffix(FOLDER_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        let name = match name.strip_suffix('/') {
            Some(stripped) => {
                is_dir = true;
                stripped
            }
            None => name,
        };
        if name.is_empty() {
            // The prefix's own marker object lists itself; not a child.
            return;
        }
        self.merge(ChildEntry {
            name: name.to_owned(),
            is_dir,
            etag: etag.map(|e| e.trim_matches('"').to_owned()),
            size,
            synthetic: false,
        });
    }

    /// Add a delimiter-rolled common prefix (always a directory).
    pub fn insert_prefix(&mut self, name: &str) {
        let name = name.strip_suffix('/').unwrap_or(name);
        if name.is_empty() {
            return;
        }
        self.merge(ChildEntry {
            name: name.to_owned(),
            is_dir: true,
            etag: None,
            size: 0,
            synthetic: false,
        });
    }

    /// Add a name that exists only in the namespace (a pinned open file).
    /// Real listing rows always win over synthetic ones.
    pub fn insert_synthetic(&mut self, name: &str) {
        if name.is_empty() || self.children.contains_key(name) {
            return;
        }
        self.children.insert(name.to_owned(), ChildEntry {
            name: name.to_owned(),
            is_dir: false,
            etag: None,
            size: 0,
            synthetic: true,
        });
    }

    fn merge(&mut self, entry: ChildEntry) {
        match self.children.get_mut(&entry.name) {
            None => {
                self.children.insert(entry.name.clone(), entry);
            }
            Some(existing) => {
                // Directory form wins; a marker's etag refines a bare prefix.
                existing.is_dir |= entry.is_dir;
                existing.synthetic = false;
                if existing.etag.is_none() {
                    existing.etag = entry.etag;
                }
                if existing.size == 0 {
                    existing.size = entry.size;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Children in name order.
    pub fn into_entries(self) -> Vec<ChildEntry> {
        self.children.into_values().collect()
    }
}
