//! In-memory tracker and peer network for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use nebula_client::tracker::join_remote;
use nebula_client::{
    AuthGrant, CheckFileRequest, CheckFileResponse, ClientConfig, PartitionAssignment,
    PeerAddr, PeerCandidate, PeerTransport, PieceRequest, PrepareUploadRequest,
    PrepareUploadResponse, RemoteEntry, RetrieveBlock, RetrieveFileRequest,
    RetrieveFileResponse, RetrievePartition, RetrievedContent, StorageStrategy, Tracker,
    UploadDoneRequest,
};
use nebula_client::progress::ProgressSink;
use nebula_core::{ContentHash, ErasureConfig, NebulaError, Result, StorePartition};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const KIB: usize = 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nebula_client=debug,nebula_core=debug")
        .with_test_writer()
        .try_init();
}

/// Deterministic, non-repeating-looking test content
pub fn generate_file(size: usize) -> Vec<u8> {
    (0..size).map(|i| ((i * 31) ^ (i / 251)) as u8).collect()
}

pub fn write_file(path: &Path, size: usize) -> Vec<u8> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let data = generate_file(size);
    std::fs::write(path, &data).unwrap();
    data
}

/// Small partitions and short timeouts so multi-partition files stay cheap
pub fn test_config(root: &Path) -> ClientConfig {
    ClientConfig {
        temp_dir: root.join("scratch"),
        partition_max_size: 256 * KIB as u64,
        probe_timeout_secs: 1,
        straggler_timeout_secs: 1,
        progress_interval_ms: 10,
        list_page_size: 2,
        ..Default::default()
    }
}

#[derive(Default)]
struct NetworkState {
    down: HashSet<String>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    pieces: HashMap<String, HashMap<ContentHash, Vec<u8>>>,
}

/// Storage peers keyed by host name
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<NetworkState>,
    pub stores: AtomicUsize,
    pub retrieves: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Host stops answering pings
    pub fn set_down(&self, host: &str) {
        self.state.lock().down.insert(host.to_string());
    }

    /// Host answers pings but refuses stores
    pub fn fail_stores(&self, host: &str) {
        self.state.lock().failing.insert(host.to_string());
    }

    /// Host answers pings but never finishes a transfer
    pub fn hang(&self, host: &str) {
        self.state.lock().hanging.insert(host.to_string());
    }

    pub fn drop_piece(&self, host: &str, hash: &ContentHash) -> bool {
        self.state
            .lock()
            .pieces
            .get_mut(host)
            .and_then(|pieces| pieces.remove(hash))
            .is_some()
    }

    pub fn pieces_on(&self, host: &str) -> usize {
        self.state.lock().pieces.get(host).map_or(0, |p| p.len())
    }

    pub fn total_pieces(&self) -> usize {
        self.state.lock().pieces.values().map(|p| p.len()).sum()
    }
}

#[async_trait::async_trait]
impl PeerTransport for FakeNetwork {
    async fn ping(&self, addr: &PeerAddr) -> Result<()> {
        if self.state.lock().down.contains(&addr.host) {
            return Err(NebulaError::peer(addr, "connection refused"));
        }
        Ok(())
    }

    async fn store_piece(&self, request: &PieceRequest, progress: ProgressSink) -> Result<()> {
        let (hanging, failing) = {
            let state = self.state.lock();
            (
                state.hanging.contains(&request.addr.host),
                state.failing.contains(&request.addr.host) || state.down.contains(&request.addr.host),
            )
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        if failing {
            return Err(NebulaError::peer(&request.addr, "store refused"));
        }

        let data = tokio::fs::read(&request.path).await?;
        if data.len() as u64 != request.size || ContentHash::compute(&data) != request.hash {
            return Err(NebulaError::peer(&request.addr, "piece does not match request"));
        }
        progress.advance(data.len() as u64);
        self.state
            .lock()
            .pieces
            .entry(request.addr.host.clone())
            .or_default()
            .insert(request.hash, data);
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn retrieve_piece(&self, request: &PieceRequest, progress: ProgressSink) -> Result<()> {
        let (hanging, data) = {
            let state = self.state.lock();
            (
                state.hanging.contains(&request.addr.host),
                state
                    .pieces
                    .get(&request.addr.host)
                    .and_then(|p| p.get(&request.hash))
                    .cloned(),
            )
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        let data = data.ok_or_else(|| NebulaError::peer(&request.addr, "piece not found"))?;

        tokio::fs::write(&request.path, &data).await?;
        progress.advance(data.len() as u64);
        self.retrieves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CommittedFile {
    partitions: Vec<StorePartition>,
}

#[derive(Default)]
struct TrackerState {
    committed: HashMap<ContentHash, CommittedFile>,
    inline: HashMap<ContentHash, Bytes>,
    /// folder path -> entry name -> entry
    folders: BTreeMap<String, BTreeMap<String, RemoteEntry>>,
    /// Folders whose listing fails
    unlistable: HashSet<String>,
}

/// Coordination service holding everything in memory.
///
/// Files below `replica_threshold` are replicated, larger ones erasure coded.
pub struct FakeTracker {
    active: Vec<String>,
    spares: Vec<String>,
    replica_threshold: u64,
    erasure: ErasureConfig,
    state: Mutex<TrackerState>,
    expired: AtomicBool,
    pub refreshes: AtomicUsize,
    pub commits: AtomicUsize,
}

impl FakeTracker {
    pub fn new(active: usize, spares: usize) -> Arc<Self> {
        let mut state = TrackerState::default();
        state.folders.insert("/".to_string(), BTreeMap::new());
        Arc::new(Self {
            active: (0..active).map(|i| format!("node{}", i)).collect(),
            spares: (0..spares).map(|i| format!("spare{}", i)).collect(),
            replica_threshold: 64 * KIB as u64,
            erasure: ErasureConfig::new(4, 2).unwrap(),
            state: Mutex::new(state),
            expired: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        })
    }

    /// Fail the next call with `CredentialExpired` until refreshed
    pub fn expire_credentials(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub fn fail_listing(&self, folder: &str) {
        self.state.lock().unlistable.insert(folder.to_string());
    }

    pub fn committed(&self, hash: &ContentHash) -> Option<Vec<StorePartition>> {
        self.state
            .lock()
            .committed
            .get(hash)
            .map(|f| f.partitions.clone())
    }

    pub fn listing(&self, folder: &str) -> Vec<RemoteEntry> {
        self.state
            .lock()
            .folders
            .get(folder)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    fn authorize(&self) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            Err(NebulaError::CredentialExpired)
        } else {
            Ok(())
        }
    }

    fn candidate(host: &str, hashes: &[ContentHash]) -> PeerCandidate {
        hashes.iter().fold(
            PeerCandidate::new(host, PeerAddr::new(host, 7000), 1_700_000_000),
            |peer, hash| {
                peer.with_grant(AuthGrant {
                    hash: *hash,
                    ticket: format!("ticket-{}-{}", host, hash),
                    signature: hash.as_bytes().to_vec(),
                })
            },
        )
    }

    fn add_entry(&self, parent: &str, entry: RemoteEntry) {
        self.state
            .lock()
            .folders
            .entry(parent.to_string())
            .or_default()
            .insert(entry.name.clone(), entry);
    }
}

#[async_trait::async_trait]
impl Tracker for FakeTracker {
    async fn check_file(&self, request: &CheckFileRequest) -> Result<CheckFileResponse> {
        self.authorize()?;
        let known = {
            let mut state = self.state.lock();
            if let Some(data) = &request.inline_data {
                state.inline.insert(request.file_hash, data.clone());
            }
            state.inline.contains_key(&request.file_hash)
                || state.committed.contains_key(&request.file_hash)
        };

        let strategy = if known {
            self.add_entry(
                &request.parent,
                RemoteEntry {
                    name: request.file_name.clone(),
                    is_folder: false,
                    hash: Some(request.file_hash),
                    size: request.file_size,
                },
            );
            StorageStrategy::AlreadyStored
        } else if request.file_size < self.replica_threshold {
            StorageStrategy::MultiReplica
        } else {
            StorageStrategy::ErasureCode(self.erasure)
        };
        Ok(CheckFileResponse { strategy })
    }

    async fn prepare_upload(&self, request: &PrepareUploadRequest) -> Result<PrepareUploadResponse> {
        self.authorize()?;
        let replica = request.partitions.len() == 1 && request.partitions[0].len() == 1;
        let partitions = request
            .partitions
            .iter()
            .map(|pieces| {
                let hashes: Vec<ContentHash> = pieces.iter().map(|p| p.hash).collect();
                let active = if replica {
                    &self.active[..]
                } else {
                    &self.active[..pieces.len().min(self.active.len())]
                };
                let peers = active
                    .iter()
                    .map(|host| Self::candidate(host, &hashes))
                    .chain(
                        self.spares
                            .iter()
                            .map(|host| Self::candidate(host, &hashes).as_spare()),
                    )
                    .collect();
                PartitionAssignment { peers }
            })
            .collect();
        Ok(PrepareUploadResponse { partitions })
    }

    async fn upload_done(&self, request: &UploadDoneRequest) -> Result<()> {
        self.authorize()?;
        self.state.lock().committed.insert(
            request.file_hash,
            CommittedFile {
                partitions: request.partitions.clone(),
            },
        );
        self.add_entry(
            &request.parent,
            RemoteEntry {
                name: request.file_name.clone(),
                is_folder: false,
                hash: Some(request.file_hash),
                size: request.file_size,
            },
        );
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn retrieve_file(&self, request: &RetrieveFileRequest) -> Result<RetrieveFileResponse> {
        self.authorize()?;
        let state = self.state.lock();
        if let Some(data) = state.inline.get(&request.file_hash) {
            return Ok(RetrieveFileResponse {
                content: RetrievedContent::Inline(data.clone()),
            });
        }
        let file = state
            .committed
            .get(&request.file_hash)
            .ok_or_else(|| NebulaError::Tracker(format!("unknown file {}", request.file_hash)))?;

        let partitions = file
            .partitions
            .iter()
            .map(|partition| RetrievePartition {
                blocks: partition
                    .blocks
                    .iter()
                    .map(|block| RetrieveBlock {
                        hash: block.hash,
                        size: block.size,
                        seq: block.seq,
                        checksum: block.checksum,
                        nodes: block
                            .store_nodes
                            .iter()
                            .map(|node| Self::candidate(node, &[block.hash]))
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Ok(RetrieveFileResponse {
            content: RetrievedContent::Partitions(partitions),
        })
    }

    async fn refresh_credentials(&self) -> Result<()> {
        self.expired.store(false, Ordering::SeqCst);
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn make_folder(&self, parent: &str, name: &str) -> Result<()> {
        self.authorize()?;
        self.add_entry(
            parent,
            RemoteEntry {
                name: name.to_string(),
                is_folder: true,
                hash: None,
                size: 0,
            },
        );
        self.state
            .lock()
            .folders
            .entry(join_remote(parent, name))
            .or_default();
        Ok(())
    }

    async fn list_directory(
        &self,
        path: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RemoteEntry>> {
        self.authorize()?;
        let state = self.state.lock();
        if state.unlistable.contains(path) {
            return Err(NebulaError::Tracker(format!("listing {} failed", path)));
        }
        let entries = state
            .folders
            .get(path)
            .ok_or_else(|| NebulaError::Tracker(format!("no such folder {}", path)))?;
        Ok(entries
            .values()
            .skip(page.saturating_sub(1) * page_size)
            .take(page_size)
            .cloned()
            .collect())
    }
}
