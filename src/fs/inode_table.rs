//! Inode-number to path translation.
//!
//! The core is path-keyed; the kernel speaks inode numbers. This table
//! assigns an inode to every path the kernel has looked up and keeps the
//! kernel-side reference count so entries die on `forget`, mirroring how
//! the kernel balances `lookup` calls.

use std::collections::HashMap;
use std::sync::Mutex;

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct Slot {
    path: String,
    nlookup: u64,
}

#[derive(Debug)]
struct Inner {
    by_ino: HashMap<u64, Slot>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

/// Bidirectional ino <-> absolute-path map with kernel refcounts.
#[derive(Debug)]
pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, Slot {
            path: "/".to_owned(),
            nlookup: u64::MAX, // the root is never forgotten
        });
        by_path.insert("/".to_owned(), ROOT_INO);
        Self {
            inner: Mutex::new(Inner {
                by_ino,
                by_path,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Absolute path for an inode the kernel previously looked up.
    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.lock().by_ino.get(&ino).map(|s| s.path.clone())
    }

    /// Join a parent inode and child name into an absolute path.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.path_of(parent)?;
        Some(if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        })
    }

    /// Register (or re-reference) a path, returning its inode. Each call
    /// accounts for one kernel lookup reference.
    pub fn assign(&self, path: &str) -> u64 {
        let mut inner = self.lock();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(slot) = inner.by_ino.get_mut(&ino) {
                slot.nlookup = slot.nlookup.saturating_add(1);
            }
            return ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.by_ino.insert(ino, Slot {
            path: path.to_owned(),
            nlookup: 1,
        });
        inner.by_path.insert(path.to_owned(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the entry dies at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        let mut inner = self.lock();
        let Some(slot) = inner.by_ino.get_mut(&ino) else {
            return;
        };
        slot.nlookup = slot.nlookup.saturating_sub(nlookup);
        if slot.nlookup == 0 {
            let path = slot.path.clone();
            inner.by_ino.remove(&ino);
            inner.by_path.remove(&path);
        }
    }

    /// Rebind an inode after a rename so later kernel calls resolve to the
    /// new location. Descendant paths are rewritten too.
    pub fn rename(&self, from: &str, to: &str) {
        let mut inner = self.lock();
        let prefix = format!("{from}/");
        let moved: Vec<(String, u64)> = inner
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old_path, ino) in moved {
            let new_path = if old_path == from {
                to.to_owned()
            } else {
                format!("{to}{}", &old_path[from.len()..])
            };
            inner.by_path.remove(&old_path);
            inner.by_path.insert(new_path.clone(), ino);
            if let Some(slot) = inner.by_ino.get_mut(&ino) {
                slot.path = new_path;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().by_ino.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
    }

    #[test]
    fn assign_is_stable_per_path() {
        let table = InodeTable::new();
        let a = table.assign("/a");
        let b = table.assign("/b");
        assert_ne!(a, b);
        assert_eq!(table.assign("/a"), a, "same path, same ino");
    }

    #[test]
    fn forget_releases_after_matching_lookups() {
        let table = InodeTable::new();
        let ino = table.assign("/f");
        table.assign("/f");
        table.forget(ino, 1);
        assert!(table.path_of(ino).is_some(), "one reference left");
        table.forget(ino, 1);
        assert!(table.path_of(ino).is_none(), "all references dropped");
    }

    #[test]
    fn child_path_joins_correctly() {
        let table = InodeTable::new();
        assert_eq!(
            table.child_path(ROOT_INO, "a").as_deref(),
            Some("/a")
        );
        let a = table.assign("/a");
        assert_eq!(table.child_path(a, "b").as_deref(), Some("/a/b"));
    }

    #[test]
    fn rename_rewrites_descendants() {
        let table = InodeTable::new();
        let d = table.assign("/d");
        let f = table.assign("/d/f");
        table.rename("/d", "/e");
        assert_eq!(table.path_of(d).as_deref(), Some("/e"));
        assert_eq!(table.path_of(f).as_deref(), Some("/e/f"));
        assert_eq!(table.assign("/e"), d, "new path resolves to the old ino");
    }
}
