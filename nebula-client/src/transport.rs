//! Peer transport contract
//!
//! Streaming store/retrieve of single pieces against one storage peer. Wire
//! framing belongs to the implementation.

use crate::peer::{AuthGrant, PeerAddr, PeerCandidate};
use crate::progress::ProgressSink;
use nebula_core::{ContentHash, Result};
use std::path::PathBuf;

/// Everything a peer needs to accept or serve one piece
#[derive(Debug, Clone)]
pub struct PieceRequest {
    pub node_id: String,
    pub addr: PeerAddr,
    pub ticket: String,
    pub signature: Vec<u8>,
    pub timestamp: u64,
    pub hash: ContentHash,
    pub size: u64,
    /// Local bytes to send, or destination of retrieved bytes
    pub path: PathBuf,
}

impl PieceRequest {
    pub fn new(
        peer: &PeerCandidate,
        grant: &AuthGrant,
        hash: ContentHash,
        size: u64,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id: peer.node_id.clone(),
            addr: peer.addr.clone(),
            ticket: grant.ticket.clone(),
            signature: grant.signature.clone(),
            timestamp: peer.timestamp,
            hash,
            size,
            path: path.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Lightweight liveness call
    async fn ping(&self, addr: &PeerAddr) -> Result<()>;

    /// Send the bytes at `request.path` to the peer
    async fn store_piece(&self, request: &PieceRequest, progress: ProgressSink) -> Result<()>;

    /// Fetch the piece into `request.path`
    async fn retrieve_piece(&self, request: &PieceRequest, progress: ProgressSink) -> Result<()>;
}
