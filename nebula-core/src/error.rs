//! Error types for Nebula
//!
//! Provides a unified error type for chunking, coding and transfer operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Nebula operations
pub type Result<T> = std::result::Result<T, NebulaError>;

/// Unified error type for Nebula
#[derive(Error, Debug)]
pub enum NebulaError {
    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    Codec(String),

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Partition {partition} is irrecoverable: {failed} blocks failed, only {parity} parity shards")]
    Irrecoverable {
        partition: usize,
        failed: usize,
        parity: usize,
    },

    // ===== Integrity Errors =====
    #[error("Hash mismatch for {}: expected {expected}, got {actual}", path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Size mismatch for {}: expected {expected}, got {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    // ===== Peer Errors =====
    #[error("Insufficient peers: {reachable} reachable, need {required}")]
    InsufficientPeers { reachable: usize, required: usize },

    #[error("Peer {peer} transfer failed: {message}")]
    PeerTransport { peer: String, message: String },

    // ===== Coordination Service Errors =====
    #[error("Credentials expired")]
    CredentialExpired,

    #[error("Tracker error: {0}")]
    Tracker(String),

    // ===== Progress Errors =====
    #[error("Unknown progress unit: {0}")]
    UnknownProgressUnit(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NebulaError {
    /// Build a transport error for the given peer
    pub fn peer(peer: impl ToString, message: impl ToString) -> Self {
        NebulaError::PeerTransport {
            peer: peer.to_string(),
            message: message.to_string(),
        }
    }

    /// Integrity failures are never retried
    pub fn is_fatal_integrity(&self) -> bool {
        matches!(
            self,
            NebulaError::HashMismatch { .. } | NebulaError::SizeMismatch { .. }
        )
    }

    pub fn is_credential_expired(&self) -> bool {
        matches!(self, NebulaError::CredentialExpired)
    }
}

impl From<reed_solomon_erasure::Error> for NebulaError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        NebulaError::Codec(err.to_string())
    }
}
