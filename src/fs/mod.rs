//! FUSE-facing layer: inode bookkeeping and the fuser adapter.

pub mod fuser;
pub mod inode_table;
