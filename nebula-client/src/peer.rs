//! Storage peer descriptors
//!
//! A `PeerCandidate` is handed out by the tracker for one transfer and never
//! changes afterwards. Probing wraps it in a `RankedPeer` carrying the
//! measured latency.

use nebula_core::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Network address of a storage peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Authorization for a single store or retrieve of one piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthGrant {
    /// Piece the grant covers
    pub hash: ContentHash,
    pub ticket: String,
    pub signature: Vec<u8>,
}

/// A storage peer offered by the tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub node_id: String,
    pub addr: PeerAddr,
    /// Timestamp the grants are bound to
    pub timestamp: u64,
    /// Backup rather than primary
    #[serde(default)]
    pub spare: bool,
    /// One grant per piece this peer may hold
    #[serde(default)]
    pub grants: Vec<AuthGrant>,
}

impl PeerCandidate {
    pub fn new(node_id: impl Into<String>, addr: PeerAddr, timestamp: u64) -> Self {
        Self {
            node_id: node_id.into(),
            addr,
            timestamp,
            spare: false,
            grants: Vec::new(),
        }
    }

    pub fn with_grant(mut self, grant: AuthGrant) -> Self {
        self.grants.push(grant);
        self
    }

    pub fn as_spare(mut self) -> Self {
        self.spare = true;
        self
    }

    /// Grant covering `hash`, if any
    pub fn grant_for(&self, hash: &ContentHash) -> Option<&AuthGrant> {
        self.grants.iter().find(|g| g.hash == *hash)
    }
}

/// Measured round-trip latency, in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Latency {
    Secs(u64),
    Unreachable,
}

impl Latency {
    /// Value reported for peers that failed to answer
    pub const UNREACHABLE_SECS: u64 = 99_999;

    pub fn from_elapsed(elapsed: Duration) -> Self {
        Latency::Secs(elapsed.as_secs())
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, Latency::Secs(_))
    }

    pub fn as_secs(&self) -> u64 {
        match self {
            Latency::Secs(s) => *s,
            Latency::Unreachable => Self::UNREACHABLE_SECS,
        }
    }
}

/// A candidate with its probe result
#[derive(Debug, Clone)]
pub struct RankedPeer {
    pub peer: PeerCandidate,
    pub latency: Latency,
    /// Position in the list the peer was probed from
    pub origin_index: usize,
}
