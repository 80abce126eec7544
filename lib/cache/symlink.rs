//! Cache of resolved symbolic link targets.
//!
//! Kept in its own map so link churn cannot disturb the stat cache's
//! eviction order. Shares the stat cache's expiry clock semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::stat::ExpiryMode;

#[derive(Debug)]
struct Entry {
    target: String,
    hit_count: u64,
    cache_date: Instant,
}

#[derive(Debug, Clone)]
pub struct SymlinkCacheConfig {
    pub capacity: usize,
    pub expire: Option<Duration>,
    pub expiry_mode: ExpiryMode,
}

impl Default for SymlinkCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            expire: Some(Duration::from_secs(15 * 60)),
            expiry_mode: ExpiryMode::Fixed,
        }
    }
}

pub struct SymlinkCache {
    config: SymlinkCacheConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SymlinkCache {
    pub fn new(config: SymlinkCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        if self
            .config
            .expire
            .is_some_and(|e| now.duration_since(entry.cache_date) > e)
        {
            entries.remove(key);
            return None;
        }
        entry.hit_count += 1;
        if self.config.expiry_mode == ExpiryMode::Sliding {
            entry.cache_date = now;
        }
        Some(entry.target.clone())
    }

    pub fn put(&self, key: &str, target: &str) {
        if self.config.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        if !entries.contains_key(key) && entries.len() >= self.config.capacity {
            // Oldest-and-coldest first, one slot's worth.
            let excess = entries.len() - self.config.capacity + 1;
            let mut victims: Vec<(Instant, u64, String)> = entries
                .iter()
                .map(|(k, e)| (e.cache_date, e.hit_count, k.clone()))
                .collect();
            victims.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            for (_, _, k) in victims.into_iter().take(excess) {
                entries.remove(&k);
            }
        }
        entries.insert(key.to_owned(), Entry {
            target: target.to_owned(),
            hit_count: 0,
            cache_date: Instant::now(),
        });
    }

    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
