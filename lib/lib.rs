//! bucketfs core library.
//!
//! The pieces that turn an object store into a POSIX-ish filesystem:
//! per-file page maps and staging files, the multipart upload scheduler,
//! the stat/symlink caches, and the bounded request pool. Everything is
//! generic over [`store::ObjectStore`]; the binary crate wires in the real
//! S3 client, tests wire in mocks.

/// Metadata caches: stats, negative lookups, symlink targets.
pub mod cache;
pub mod error;
/// The file-descriptor cache and upload pipeline.
pub mod fd;
/// The filesystem facade consumed by the FUSE adapter.
pub mod fs;
pub mod meta;
pub mod page_map;
pub mod pool;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use meta::{FileStat, Meta};
pub use page_map::ByteRange;
