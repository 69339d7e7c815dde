//! Coordination service contract
//!
//! The tracker decides the storage strategy for a file, hands out peers with
//! per-piece authorization, records committed uploads and answers retrievals.

use crate::peer::PeerCandidate;
use bytes::Bytes;
use nebula_core::{ContentHash, ErasureConfig, Result, StorePartition};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CheckFileRequest {
    pub file_hash: ContentHash,
    pub file_size: u64,
    pub file_name: String,
    /// Remote folder the file goes into
    pub parent: String,
    /// Whole content for files below the inline threshold
    pub inline_data: Option<Bytes>,
}

/// How the tracker wants a file stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageStrategy {
    AlreadyStored,
    MultiReplica,
    ErasureCode(ErasureConfig),
}

#[derive(Debug, Clone)]
pub struct CheckFileResponse {
    pub strategy: StorageStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceDescriptor {
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct PrepareUploadRequest {
    pub file_hash: ContentHash,
    pub file_size: u64,
    /// Pieces of each partition; replica mode sends one partition with one piece
    pub partitions: Vec<Vec<PieceDescriptor>>,
}

/// Peers assigned to one partition
#[derive(Debug, Clone, Default)]
pub struct PartitionAssignment {
    pub peers: Vec<PeerCandidate>,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareUploadResponse {
    pub partitions: Vec<PartitionAssignment>,
}

#[derive(Debug, Clone)]
pub struct UploadDoneRequest {
    pub file_hash: ContentHash,
    pub file_size: u64,
    pub file_name: String,
    pub parent: String,
    pub partitions: Vec<StorePartition>,
}

#[derive(Debug, Clone)]
pub struct RetrieveFileRequest {
    pub file_hash: ContentHash,
    pub file_size: u64,
}

/// One stored shard or replica and where it can be fetched
#[derive(Debug, Clone)]
pub struct RetrieveBlock {
    pub hash: ContentHash,
    pub size: u64,
    pub seq: usize,
    pub checksum: bool,
    pub nodes: Vec<PeerCandidate>,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievePartition {
    pub blocks: Vec<RetrieveBlock>,
}

impl RetrievePartition {
    pub fn data_shards(&self) -> usize {
        self.blocks.iter().filter(|b| !b.checksum).count()
    }

    pub fn parity_shards(&self) -> usize {
        self.blocks.iter().filter(|b| b.checksum).count()
    }
}

#[derive(Debug, Clone)]
pub enum RetrievedContent {
    Inline(Bytes),
    Partitions(Vec<RetrievePartition>),
}

#[derive(Debug, Clone)]
pub struct RetrieveFileResponse {
    pub content: RetrievedContent,
}

/// One entry of a remote folder listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub is_folder: bool,
    pub hash: Option<ContentHash>,
    pub size: u64,
}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {
    async fn check_file(&self, request: &CheckFileRequest) -> Result<CheckFileResponse>;

    async fn prepare_upload(&self, request: &PrepareUploadRequest)
        -> Result<PrepareUploadResponse>;

    async fn upload_done(&self, request: &UploadDoneRequest) -> Result<()>;

    async fn retrieve_file(&self, request: &RetrieveFileRequest) -> Result<RetrieveFileResponse>;

    /// Re-fetch the tracker's signing key after `CredentialExpired`
    async fn refresh_credentials(&self) -> Result<()>;

    async fn make_folder(&self, parent: &str, name: &str) -> Result<()>;

    /// One page (1-based) of a remote folder
    async fn list_directory(
        &self,
        path: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RemoteEntry>>;
}

/// Run `op`, refreshing credentials and retrying exactly once if they expired
pub async fn with_fresh_credentials<T, F, Fut>(
    tracker: &dyn Tracker,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_credential_expired() => {
            warn!(operation, "Tracker credentials expired, refreshing");
            tracker.refresh_credentials().await?;
            op().await
        }
        other => other,
    }
}

/// `parent/name` for remote paths
pub fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}
