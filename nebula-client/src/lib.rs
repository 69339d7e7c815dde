//! Nebula Client
//!
//! Client-side transfer engine for the Nebula storage network.
//! This crate provides:
//! - Peer liveness probing and selection with backup substitution
//! - Bounded, cancellable concurrency for file and shard transfers
//! - Upload pipeline (inline, multi-replica, erasure-coded)
//! - Download pipeline with shard reconstruction and straggler cutoff
//! - Progress accounting and event reporting
//!
//! The tracker and peer wire protocols are abstracted behind the [`Tracker`]
//! and [`PeerTransport`] traits.

pub mod backup;
pub mod config;
pub mod context;
pub mod controller;
pub mod download;
pub mod engine;
pub mod peer;
pub mod prober;
pub mod progress;
pub mod tracker;
pub mod transport;
pub mod upload;

pub use backup::BackupIndex;
pub use config::{ClientConfig, ConfigError};
pub use controller::{Admission, Controller};
pub use download::{DownloadOutcome, Downloader};
pub use engine::{ClientEngine, DirSummary, TransferEvent};
pub use peer::{AuthGrant, Latency, PeerAddr, PeerCandidate, RankedPeer};
pub use prober::Prober;
pub use progress::{ProgressEntry, ProgressLedger, ProgressMessage, ProgressSink, TransferKind};
pub use tracker::{
    CheckFileRequest, CheckFileResponse, PartitionAssignment, PieceDescriptor,
    PrepareUploadRequest, PrepareUploadResponse, RemoteEntry, RetrieveBlock,
    RetrieveFileRequest, RetrieveFileResponse, RetrievePartition, RetrievedContent,
    StorageStrategy, Tracker, UploadDoneRequest,
};
pub use transport::{PeerTransport, PieceRequest};
pub use upload::{UploadOutcome, Uploader};

pub use nebula_core::{ContentHash, NebulaError, Result};
