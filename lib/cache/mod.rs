//! Metadata caches: object stats, negative lookups and symlink targets.

pub mod stat;
pub mod symlink;

pub use stat::{ExpiryMode, Lookup, StatCache, StatCacheConfig, StatSnapshot};
pub use symlink::{SymlinkCache, SymlinkCacheConfig};
