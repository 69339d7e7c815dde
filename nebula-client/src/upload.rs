//! Upload pipeline
//!
//! Per file: `check -> (skip | replicate | erasure code) -> commit`.
//!
//! No commit is sent unless every required shard or replica reached a peer,
//! and nothing is committed after shutdown. Shard and partition files live in
//! a scratch directory that is removed when the upload finishes either way.

use crate::backup::BackupIndex;
use crate::context::{blocking, unit_key, TransferContext};
use crate::controller::Controller;
use crate::peer::{PeerCandidate, RankedPeer};
use crate::prober::partition_spare_vs_active;
use crate::progress::{ProgressSink, TransferKind};
use crate::tracker::{
    with_fresh_credentials, CheckFileRequest, PieceDescriptor, PrepareUploadRequest,
    StorageStrategy, UploadDoneRequest,
};
use crate::transport::{PeerTransport, PieceRequest};
use bytes::Bytes;
use nebula_core::chunk::file_name_of;
use nebula_core::{
    hash_file, partition_plan, split, ContentHash, ErasureConfig, HashFile, NebulaError,
    PartitionFile, Result, ShardCodec, StoreBlock, StorePartition,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What happened to an uploaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The tracker already had the content
    AlreadyStored,
    /// Small enough to travel with the existence check
    Inline,
    Replicated { peers: usize },
    ErasureCoded { partitions: usize, shards: usize },
}

/// Drives uploads of single files
#[derive(Clone)]
pub struct Uploader {
    ctx: TransferContext,
}

impl Uploader {
    pub fn new(ctx: TransferContext) -> Self {
        Self { ctx }
    }

    /// Upload `path` into the remote folder `parent`
    #[instrument(skip(self), fields(file = %path.display()))]
    pub async fn upload_file(&self, path: &Path, parent: &str) -> Result<UploadOutcome> {
        self.ctx.ensure_running()?;
        let key = unit_key(path);
        let name = file_name_of(path)?;

        let source = path.to_path_buf();
        let (file_hash, file_size) = blocking(move || hash_file(&source)).await?;
        self.ctx
            .ledger
            .track(&key, TransferKind::Upload, file_size, Some(path.to_path_buf()));

        let inline_data = if file_size < self.ctx.config.inline_file_size {
            Some(Bytes::from(tokio::fs::read(path).await?))
        } else {
            None
        };
        let inline = inline_data.is_some();

        let tracker = self.ctx.tracker.clone();
        let check = CheckFileRequest {
            file_hash,
            file_size,
            file_name: name.clone(),
            parent: parent.to_string(),
            inline_data,
        };
        let response =
            with_fresh_credentials(tracker.as_ref(), "check_file", || tracker.check_file(&check))
                .await?;

        let (partitions, outcome) = match response.strategy {
            StorageStrategy::AlreadyStored => {
                self.ctx.ledger.complete(&key)?;
                info!(hash = %file_hash, inline, "Content already stored, skipping upload");
                return Ok(if inline {
                    UploadOutcome::Inline
                } else {
                    UploadOutcome::AlreadyStored
                });
            }
            StorageStrategy::MultiReplica => {
                let (partition, peers) = self
                    .upload_replicas(path, file_hash, file_size, &key)
                    .await?;
                (vec![partition], UploadOutcome::Replicated { peers })
            }
            StorageStrategy::ErasureCode(config) => {
                let partitions = self
                    .upload_erasure(path, file_hash, file_size, &key, config)
                    .await?;
                let outcome = UploadOutcome::ErasureCoded {
                    partitions: partitions.len(),
                    shards: partitions.iter().map(|p| p.blocks.len()).sum(),
                };
                (partitions, outcome)
            }
        };

        self.ctx.ensure_running()?;
        let done = UploadDoneRequest {
            file_hash,
            file_size,
            file_name: name,
            parent: parent.to_string(),
            partitions,
        };
        with_fresh_credentials(tracker.as_ref(), "upload_done", || tracker.upload_done(&done))
            .await?;

        self.ctx.ledger.complete(&key)?;
        info!(hash = %file_hash, size = file_size, outcome = ?outcome, "Upload committed");
        Ok(outcome)
    }

    /// Store the whole file on every selected peer
    async fn upload_replicas(
        &self,
        path: &Path,
        file_hash: ContentHash,
        file_size: u64,
        key: &str,
    ) -> Result<(StorePartition, usize)> {
        let piece = HashFile {
            size: file_size,
            path: path.to_path_buf(),
            hash: file_hash,
            slice_index: 0,
        };

        let tracker = self.ctx.tracker.clone();
        let prepare = PrepareUploadRequest {
            file_hash,
            file_size,
            partitions: vec![vec![PieceDescriptor {
                hash: file_hash,
                size: file_size,
            }]],
        };
        let response = with_fresh_credentials(tracker.as_ref(), "prepare_upload", || {
            tracker.prepare_upload(&prepare)
        })
        .await?;
        let candidates = response
            .partitions
            .into_iter()
            .next()
            .map(|p| p.peers)
            .unwrap_or_default();

        let config = &self.ctx.config;
        let (primary, backup) = self
            .ctx
            .prober
            .rank_replica_peers(&candidates, config.replica_num, config.min_replica_num)
            .await?;
        info!(
            primary = primary.len(),
            backup = backup.len(),
            "Selected replica peers"
        );
        let attempts = primary.len() as u64;
        self.ctx.ledger.set_total(key, file_size * attempts)?;

        let check = piece.clone();
        blocking(move || check.verify()).await?;

        let controller = self.ctx.block_controller();
        let mut stored = Vec::new();
        let mut failed = 0usize;
        for (peer, result) in self.store_replicas(&controller, &piece, primary, key).await {
            match result {
                Ok(()) => stored.push(peer.node_id),
                Err(e) if e.is_fatal_integrity() => return Err(e),
                Err(e) => {
                    warn!(peer = %peer.addr, error = %e, "Replica store failed");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            self.ctx.ensure_running()?;
            if backup.len() < failed {
                error!(
                    failed,
                    backup = backup.len(),
                    "Not enough backup peers to replace failed replicas"
                );
                return Err(NebulaError::InsufficientPeers {
                    reachable: stored.len() + backup.len(),
                    required: stored.len() + failed,
                });
            }

            let retry: Vec<RankedPeer> = backup.into_iter().take(failed).collect();
            // bytes already sent to failed peers stay counted
            self.ctx
                .ledger
                .set_total(key, file_size * (attempts + retry.len() as u64))?;
            for (peer, result) in self.store_replicas(&controller, &piece, retry, key).await {
                match result {
                    Ok(()) => {
                        info!(peer = %peer.addr, "Replica stored on backup peer");
                        stored.push(peer.node_id);
                    }
                    Err(e) => {
                        error!(peer = %peer.addr, error = %e, "Backup replica store failed");
                        return Err(e);
                    }
                }
            }
        }

        let peers = stored.len();
        let block = StoreBlock {
            store_nodes: stored,
            ..StoreBlock::new(&piece, false)
        };
        Ok((StorePartition::new(vec![block]), peers))
    }

    async fn store_replicas(
        &self,
        controller: &Controller,
        piece: &HashFile,
        peers: Vec<RankedPeer>,
        key: &str,
    ) -> Vec<(PeerCandidate, Result<()>)> {
        let handles: Vec<_> = peers
            .iter()
            .map(|ranked| {
                let transport = self.ctx.transport.clone();
                let sink = ProgressSink::new(self.ctx.ledger.clone(), key);
                let peer = ranked.peer.clone();
                let piece = piece.clone();
                controller.spawn(async move { store_on(transport.as_ref(), &peer, &piece, sink).await })
            })
            .collect();

        let results = Controller::join(handles).await;
        peers.into_iter().map(|r| r.peer).zip(results).collect()
    }

    /// Partition, encode and store every shard
    #[instrument(skip(self, path, key, config), fields(size = file_size))]
    async fn upload_erasure(
        &self,
        path: &Path,
        file_hash: ContentHash,
        file_size: u64,
        key: &str,
        config: ErasureConfig,
    ) -> Result<Vec<StorePartition>> {
        let scratch = self.ctx.scratch_dir("upload-")?;
        let name = file_name_of(path)?;
        let (partition_size, partition_count) =
            partition_plan(file_size, self.ctx.config.partition_max_size);

        let parts = {
            let out = scratch.path().to_path_buf();
            let source = path.to_path_buf();
            blocking(move || split(&out, &source, file_size, partition_size, partition_count))
                .await?
        };

        let codec = Arc::new(ShardCodec::new(config)?);
        let mut partitions = Vec::with_capacity(parts.len());
        for part in parts {
            let pieces = {
                let codec = codec.clone();
                let out = scratch.path().to_path_buf();
                let source = part.clone();
                blocking(move || codec.encode(&out, &source)).await?
            };
            if part != path {
                tokio::fs::remove_file(&part).await?;
            }
            partitions.push(PartitionFile {
                path: part,
                pieces,
                origin_name: name.clone(),
                origin_hash: file_hash,
                origin_size: file_size,
                data_shards: config.data_shards,
                parity_shards: config.parity_shards,
            });
        }

        let total: u64 = partitions.iter().map(|p| p.encoded_size()).sum();
        self.ctx.ledger.set_total(key, total)?;
        for piece in partitions.iter().flat_map(|p| &p.pieces) {
            self.ctx.ledger.map_to_origin(&unit_key(&piece.path), key);
        }
        info!(
            partitions = partitions.len(),
            data_shards = config.data_shards,
            parity_shards = config.parity_shards,
            "Encoded file for erasure upload"
        );

        let tracker = self.ctx.tracker.clone();
        let prepare = PrepareUploadRequest {
            file_hash,
            file_size,
            partitions: partitions
                .iter()
                .map(|p| {
                    p.pieces
                        .iter()
                        .map(|piece| PieceDescriptor {
                            hash: piece.hash,
                            size: piece.size,
                        })
                        .collect()
                })
                .collect(),
        };
        let response = with_fresh_credentials(tracker.as_ref(), "prepare_upload", || {
            tracker.prepare_upload(&prepare)
        })
        .await?;
        if response.partitions.len() != partitions.len() {
            return Err(NebulaError::Tracker(format!(
                "tracker assigned peers for {} partitions, expected {}",
                response.partitions.len(),
                partitions.len()
            )));
        }

        let mut stored = Vec::with_capacity(partitions.len());
        for (index, (partition, assignment)) in
            partitions.iter().zip(response.partitions).enumerate()
        {
            stored.push(self.store_partition(index, partition, assignment.peers).await?);
        }
        Ok(stored)
    }

    #[instrument(skip(self, partition, peers), fields(pieces = partition.pieces.len()))]
    async fn store_partition(
        &self,
        index: usize,
        partition: &PartitionFile,
        peers: Vec<PeerCandidate>,
    ) -> Result<StorePartition> {
        let (active, spare) = partition_spare_vs_active(peers);
        if active.len() < partition.pieces.len() {
            return Err(NebulaError::InsufficientPeers {
                reachable: active.len(),
                required: partition.pieces.len(),
            });
        }

        let backups = Arc::new(Mutex::new(BackupIndex::build(spare)));
        let controller = self.ctx.block_controller();
        let handles: Vec<_> = partition
            .pieces
            .iter()
            .zip(active)
            .map(|(piece, peer)| {
                let upload = ShardUpload {
                    transport: self.ctx.transport.clone(),
                    piece: piece.clone(),
                    checksum: partition.is_parity(piece.slice_index),
                    peer,
                    backups: backups.clone(),
                    sink: ProgressSink::new(self.ctx.ledger.clone(), unit_key(&piece.path)),
                };
                controller.spawn(upload.run())
            })
            .collect();

        let mut blocks = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for result in Controller::join(handles).await {
            match result {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    error!(partition = index, error = %e, "Shard upload failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        debug!(partition = index, blocks = blocks.len(), "Partition stored");
        Ok(StorePartition::new(blocks))
    }
}

/// One shard on its way to a peer, falling back to backups on failure
struct ShardUpload {
    transport: Arc<dyn PeerTransport>,
    piece: HashFile,
    checksum: bool,
    peer: PeerCandidate,
    backups: Arc<Mutex<BackupIndex>>,
    sink: ProgressSink,
}

impl ShardUpload {
    async fn run(self) -> Result<StoreBlock> {
        let piece = self.piece.clone();
        blocking(move || piece.verify()).await?;

        let mut peer = self.peer;
        loop {
            match store_on(self.transport.as_ref(), &peer, &self.piece, self.sink.clone()).await {
                Ok(()) => {
                    debug!(shard = self.piece.slice_index, peer = %peer.addr, "Shard stored");
                    return Ok(StoreBlock::new(&self.piece, self.checksum).with_node(peer.node_id));
                }
                Err(e) if e.is_fatal_integrity() => return Err(e),
                Err(e) => {
                    let substitute = self.backups.lock().choose(&self.piece.hash);
                    match substitute {
                        Some(backup) => {
                            warn!(
                                shard = self.piece.slice_index,
                                failed = %peer.addr,
                                backup = %backup.addr,
                                error = %e,
                                "Shard store failed, retrying on backup"
                            );
                            peer = backup;
                        }
                        None => {
                            return Err(NebulaError::PeerTransport {
                                peer: peer.addr.to_string(),
                                message: format!(
                                    "shard {}: {} (no backup left)",
                                    self.piece.slice_index, e
                                ),
                            });
                        }
                    }
                }
            }
        }
    }
}

async fn store_on(
    transport: &dyn PeerTransport,
    peer: &PeerCandidate,
    piece: &HashFile,
    sink: ProgressSink,
) -> Result<()> {
    let grant = peer.grant_for(&piece.hash).ok_or_else(|| {
        NebulaError::peer(
            &peer.addr,
            format!("no authorization for piece {}", piece.hash),
        )
    })?;
    let request = PieceRequest::new(peer, grant, piece.hash, piece.size, &piece.path);
    transport.store_piece(&request, sink).await
}
