//! Nebula Core Library
//!
//! Building blocks for the Nebula storage client.
//! This crate provides:
//! - Partition arithmetic and file split/join
//! - File-level Reed-Solomon erasure coding
//! - SHA-1 content hashing
//! - Transfer unit records and error handling

pub mod chunk;
pub mod erasure;
pub mod error;
pub mod file;
pub mod hash;

pub use chunk::{
    join, partition_file_name, partition_plan, partition_size_at, partition_sizes,
    shard_file_name, split,
};
pub use erasure::{shard_path, ErasureConfig, ShardCodec};
pub use error::{NebulaError, Result};
pub use file::{HashFile, PartitionFile, StoreBlock, StorePartition};
pub use hash::{hash_file, verify_file, ContentHash};

/// Maximum bytes per partition before a file is split
pub const PARTITION_MAX_SIZE: u64 = 256 * 1024 * 1024; // 256 MB

/// Files strictly smaller than this travel inline with the existence check
pub const INLINE_FILE_SIZE: u64 = 8 * 1024; // 8 KB

/// Desired and minimum replica counts for whole-file replication
pub const REPLICA_NUM: usize = 5;
pub const MIN_REPLICA_NUM: usize = 3;
