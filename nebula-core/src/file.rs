//! Transfer units and their durable records
//!
//! `HashFile` and `PartitionFile` describe temporary on-disk bytes produced while
//! preparing an upload. `StoreBlock` and `StorePartition` are what gets committed
//! once those bytes have reached their peers.

use crate::error::Result;
use crate::hash::{hash_file, verify_file, ContentHash};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One physical shard or replica unit on local disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashFile {
    /// Byte length of the file at `path`
    pub size: u64,
    /// Temporary location of the bytes
    pub path: PathBuf,
    /// Hash of the bytes at `path`
    pub hash: ContentHash,
    /// Zero-based index within the owning partition
    pub slice_index: usize,
}

impl HashFile {
    /// Hash the file at `path` and record it as slice `slice_index`
    pub fn from_path(path: impl Into<PathBuf>, slice_index: usize) -> Result<Self> {
        let path = path.into();
        let (hash, size) = hash_file(&path)?;
        Ok(Self {
            size,
            path,
            hash,
            slice_index,
        })
    }

    /// Confirm the bytes on disk still match the recorded size and hash
    pub fn verify(&self) -> Result<()> {
        verify_file(&self.path, &self.hash, self.size)
    }
}

/// One partition of a file, with its shards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionFile {
    /// Temporary file holding the partition bytes
    pub path: PathBuf,
    /// Shards in index order; data shards first, then parity
    pub pieces: Vec<HashFile>,
    pub origin_name: String,
    pub origin_hash: ContentHash,
    pub origin_size: u64,
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl PartitionFile {
    /// Whether the piece at `index` is a parity shard
    pub fn is_parity(&self, index: usize) -> bool {
        index >= self.data_shards
    }

    /// Sum of all piece sizes
    pub fn encoded_size(&self) -> u64 {
        self.pieces.iter().map(|p| p.size).sum()
    }
}

/// Where a shard or replica ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreBlock {
    pub hash: ContentHash,
    pub size: u64,
    /// Position of the shard within its partition
    pub seq: usize,
    /// Parity ("checksum") shard
    pub checksum: bool,
    /// Peers holding a copy
    pub store_nodes: Vec<String>,
}

impl StoreBlock {
    pub fn new(piece: &HashFile, checksum: bool) -> Self {
        Self {
            hash: piece.hash,
            size: piece.size,
            seq: piece.slice_index,
            checksum,
            store_nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.store_nodes.push(node.into());
        self
    }
}

/// Committed record of one partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePartition {
    pub blocks: Vec<StoreBlock>,
}

impl StorePartition {
    pub fn new(mut blocks: Vec<StoreBlock>) -> Self {
        blocks.sort_by_key(|b| b.seq);
        Self { blocks }
    }

    pub fn data_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.checksum).count()
    }

    pub fn parity_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.checksum).count()
    }
}
