//! Download pipeline
//!
//! A file comes back either inline, as a single replicated block, or as one or
//! more erasure coded partitions. Everything is assembled in a scratch
//! directory and only moved to the destination once the whole file hash
//! checks out, so a failed or cancelled download never leaves a partial file
//! behind.

use crate::context::{blocking, unit_key, TransferContext};
use crate::controller::Controller;
use crate::peer::PeerCandidate;
use crate::prober::Prober;
use crate::progress::{ProgressSink, TransferKind};
use crate::tracker::{
    with_fresh_credentials, RetrieveBlock, RetrieveFileRequest, RetrievePartition,
    RetrievedContent,
};
use crate::transport::{PeerTransport, PieceRequest};
use nebula_core::chunk::file_name_of;
use nebula_core::{
    hash_file, join, partition_file_name, partition_size_at, shard_path, verify_file,
    ContentHash, ErasureConfig, NebulaError, Result, ShardCodec,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How often the straggler watchdog re-checks once its window has passed
const STRAGGLER_POLL: Duration = Duration::from_millis(200);

/// What happened to a downloaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Destination already held the same content
    AlreadyPresent,
    /// Zero-length file created locally
    Empty,
    Inline,
    Replica,
    ErasureCoded { partitions: usize },
}

/// Drives downloads of single files
#[derive(Clone)]
pub struct Downloader {
    ctx: TransferContext,
}

impl Downloader {
    pub fn new(ctx: TransferContext) -> Self {
        Self { ctx }
    }

    /// Fetch the file with `file_hash`/`file_size` into `dest`
    #[instrument(skip(self), fields(dest = %dest.display()))]
    pub async fn download_file(
        &self,
        file_hash: ContentHash,
        file_size: u64,
        dest: &Path,
    ) -> Result<DownloadOutcome> {
        self.ctx.ensure_running()?;
        let key = unit_key(dest);
        self.ctx
            .ledger
            .track(&key, TransferKind::Download, file_size, Some(dest.to_path_buf()));

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if file_size == 0 {
            tokio::fs::File::create(dest).await?;
            self.ctx.ledger.complete(&key)?;
            return Ok(DownloadOutcome::Empty);
        }

        if local_copy_matches(dest, file_hash, file_size).await {
            info!(hash = %file_hash, "Destination already up to date, skipping download");
            self.ctx.ledger.complete(&key)?;
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        let tracker = self.ctx.tracker.clone();
        let request = RetrieveFileRequest {
            file_hash,
            file_size,
        };
        let response = with_fresh_credentials(tracker.as_ref(), "retrieve_file", || {
            tracker.retrieve_file(&request)
        })
        .await?;

        let scratch = self.ctx.scratch_dir("download-")?;
        let name = file_name_of(dest)?;
        let assembled = scratch.path().join(&name);

        let outcome = match response.content {
            RetrievedContent::Inline(bytes) => {
                tokio::fs::write(&assembled, &bytes).await?;
                DownloadOutcome::Inline
            }
            RetrievedContent::Partitions(partitions) => {
                if partitions.is_empty() {
                    return Err(NebulaError::Tracker(format!(
                        "no partitions returned for {}",
                        file_hash
                    )));
                }
                if partitions.len() == 1 && partitions[0].blocks.len() == 1 {
                    let block = &partitions[0].blocks[0];
                    self.download_replica(block, &assembled, &key).await?;
                    DownloadOutcome::Replica
                } else {
                    self.download_erasure(&partitions, scratch.path(), &name, file_size, &key)
                        .await?;
                    DownloadOutcome::ErasureCoded {
                        partitions: partitions.len(),
                    }
                }
            }
        };

        self.ctx.ensure_running()?;
        {
            let assembled = assembled.clone();
            blocking(move || verify_file(&assembled, &file_hash, file_size)).await?;
        }
        move_into_place(&assembled, dest).await?;

        self.ctx.ledger.complete(&key)?;
        info!(hash = %file_hash, size = file_size, outcome = ?outcome, "Download complete");
        Ok(outcome)
    }

    /// Fetch a whole-file replica, trying nodes fastest first
    async fn download_replica(&self, block: &RetrieveBlock, out: &Path, key: &str) -> Result<()> {
        let ranked = self.ctx.prober.rank(&block.nodes).await;
        let mut last_error = None;

        for candidate in ranked.into_iter().filter(|r| r.latency.is_reachable()) {
            self.ctx.ensure_running()?;
            let sink = ProgressSink::new(self.ctx.ledger.clone(), key);
            match retrieve_from(self.ctx.transport.as_ref(), &candidate.peer, block, out, sink)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal_integrity() => return Err(e),
                Err(e) => {
                    warn!(peer = %candidate.peer.addr, error = %e, "Replica retrieve failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NebulaError::InsufficientPeers {
            reachable: 0,
            required: 1,
        }))
    }

    /// Retrieve, decode and join every partition in sequence order
    async fn download_erasure(
        &self,
        partitions: &[RetrievePartition],
        scratch: &Path,
        name: &str,
        file_size: u64,
        key: &str,
    ) -> Result<()> {
        let total: u64 = partitions
            .iter()
            .flat_map(|p| &p.blocks)
            .map(|b| b.size)
            .sum();
        self.ctx.ledger.set_total(key, total)?;

        let count = partitions.len();
        let mut outputs = Vec::with_capacity(count);
        for (index, partition) in partitions.iter().enumerate() {
            let part_name = if count > 1 {
                partition_file_name(name, index)
            } else {
                name.to_string()
            };
            let part_size = partition_size_at(file_size, count, index);
            outputs.push(
                self.download_partition(index, partition, &scratch.join(part_name), part_size, key)
                    .await?,
            );
        }

        if count > 1 {
            let dest = scratch.join(name);
            let parts = outputs.clone();
            blocking(move || join(&dest, &parts)).await?;
            for part in &outputs {
                tokio::fs::remove_file(part).await?;
            }
        }
        Ok(())
    }

    /// Fetch the blocks of one partition into `<prefix>.<seq>` and decode them
    /// into `prefix`
    #[instrument(skip(self, partition, prefix, key), fields(blocks = partition.blocks.len()))]
    async fn download_partition(
        &self,
        index: usize,
        partition: &RetrievePartition,
        prefix: &Path,
        part_size: u64,
        key: &str,
    ) -> Result<PathBuf> {
        let data_shards = partition.data_shards();
        let parity_shards = partition.parity_shards();
        let codec = Arc::new(ShardCodec::new(ErasureConfig::new(
            data_shards,
            parity_shards,
        )?)?);

        let controller = self.ctx.block_controller();
        let succeeded = Arc::new(AtomicUsize::new(0));
        let finished = CancellationToken::new();
        let watchdog = tokio::spawn(straggler_watchdog(
            controller.clone(),
            succeeded.clone(),
            data_shards,
            self.ctx.config.straggler_timeout(),
            finished.clone(),
        ));

        let handles: Vec<_> = partition
            .blocks
            .iter()
            .map(|block| {
                let dest = shard_path(prefix, block.seq);
                let unit = unit_key(&dest);
                self.ctx.ledger.map_to_origin(&unit, key);
                let fetch = BlockFetch {
                    prober: self.ctx.prober.clone(),
                    transport: self.ctx.transport.clone(),
                    block: block.clone(),
                    dest: dest.clone(),
                    sink: ProgressSink::new(self.ctx.ledger.clone(), unit),
                    succeeded: succeeded.clone(),
                };
                controller.spawn_with_cleanup(fetch.run(), move || {
                    let _ = std::fs::remove_file(&dest);
                })
            })
            .collect();

        let results = Controller::join(handles).await;
        finished.cancel();
        let _ = watchdog.await;
        self.ctx.ensure_running()?;

        let mut failed = 0usize;
        for (block, result) in partition.blocks.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal_integrity() => {
                    error!(partition = index, seq = block.seq, error = %e, "Block failed integrity check");
                    return Err(e);
                }
                Err(e) => {
                    warn!(partition = index, seq = block.seq, error = %e, "Block retrieve failed");
                    failed += 1;
                    // Decode must see a failed block as absent
                    let _ = tokio::fs::remove_file(shard_path(prefix, block.seq)).await;
                }
            }
        }

        if failed > parity_shards {
            error!(partition = index, failed, parity = parity_shards, "Partition is unrecoverable");
            return Err(NebulaError::Irrecoverable {
                partition: index,
                failed,
                parity: parity_shards,
            });
        }
        let available = partition.blocks.len() - failed;
        if available < data_shards {
            return Err(NebulaError::InsufficientShards {
                available,
                required: data_shards,
            });
        }

        {
            let codec = codec.clone();
            let prefix = prefix.to_path_buf();
            blocking(move || codec.decode(&prefix, &prefix, part_size)).await?;
        }
        for shard in codec.shard_paths(prefix) {
            let _ = tokio::fs::remove_file(shard).await;
        }

        debug!(partition = index, failed, size = part_size, "Partition decoded");
        Ok(prefix.to_path_buf())
    }
}

/// One block fetched from its fastest node and verified
struct BlockFetch {
    prober: Arc<Prober>,
    transport: Arc<dyn PeerTransport>,
    block: RetrieveBlock,
    dest: PathBuf,
    sink: ProgressSink,
    succeeded: Arc<AtomicUsize>,
}

impl BlockFetch {
    async fn run(self) -> Result<()> {
        let node = self
            .prober
            .pick_fastest(&self.block.nodes)
            .await
            .ok_or_else(|| NebulaError::PeerTransport {
                peer: "-".to_string(),
                message: format!("block {} has no reachable node", self.block.seq),
            })?;

        retrieve_from(
            self.transport.as_ref(),
            &node.peer,
            &self.block,
            &self.dest,
            self.sink,
        )
        .await?;
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Retrieve one block from `peer` into `dest` and check its hash
async fn retrieve_from(
    transport: &dyn PeerTransport,
    peer: &PeerCandidate,
    block: &RetrieveBlock,
    dest: &Path,
    sink: ProgressSink,
) -> Result<()> {
    let grant = peer.grant_for(&block.hash).ok_or_else(|| {
        NebulaError::peer(&peer.addr, format!("no authorization for block {}", block.hash))
    })?;
    let request = PieceRequest::new(peer, grant, block.hash, block.size, dest);
    if let Err(e) = transport.retrieve_piece(&request, sink).await {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(e);
    }

    let (path, hash, size) = (dest.to_path_buf(), block.hash, block.size);
    blocking(move || verify_file(&path, &hash, size)).await
}

/// Once `window` has passed and at least `data_shards` blocks are in, cancel
/// the stragglers
async fn straggler_watchdog(
    controller: Controller,
    succeeded: Arc<AtomicUsize>,
    data_shards: usize,
    window: Duration,
    finished: CancellationToken,
) {
    tokio::select! {
        _ = finished.cancelled() => return,
        _ = tokio::time::sleep(window) => {}
    }
    loop {
        if succeeded.load(Ordering::SeqCst) >= data_shards {
            if controller.outstanding() > 0 {
                warn!(
                    outstanding = controller.outstanding(),
                    "Enough shards retrieved, cancelling slow transfers"
                );
                controller.cancel();
            }
            return;
        }
        tokio::select! {
            _ = finished.cancelled() => return,
            _ = tokio::time::sleep(STRAGGLER_POLL) => {}
        }
    }
}

async fn local_copy_matches(dest: &Path, file_hash: ContentHash, file_size: u64) -> bool {
    match tokio::fs::metadata(dest).await {
        Ok(meta) if meta.is_file() && meta.len() == file_size => {}
        _ => return false,
    }
    let path = dest.to_path_buf();
    matches!(
        blocking(move || hash_file(&path)).await,
        Ok((hash, _)) if hash == file_hash
    )
}

/// Rename into place, copying when the scratch dir is on another filesystem
async fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    let staging = to.with_file_name(format!(".{}.partial", file_name_of(to)?));
    tokio::fs::copy(from, &staging).await?;
    tokio::fs::rename(&staging, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
