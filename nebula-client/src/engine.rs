//! Client engine
//!
//! Public entry points for uploads, downloads and progress queries. Every file
//! transfer, single or part of a directory, holds a slot of one engine-wide
//! controller of width `file_concurrency`, and `shutdown` waits for all of
//! them. Each file fans out per shard through its own controller of width
//! `block_concurrency`.

use crate::config::ClientConfig;
use crate::context::{unit_key, TransferContext};
use crate::controller::Controller;
use crate::download::{DownloadOutcome, Downloader};
use crate::progress::{ProgressLedger, ProgressMessage, TransferKind};
use crate::tracker::{join_remote, with_fresh_credentials, Tracker};
use crate::transport::PeerTransport;
use crate::upload::{UploadOutcome, Uploader};
use nebula_core::chunk::file_name_of;
use nebula_core::{ContentHash, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Notification sent to event subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress(ProgressMessage),
    Done {
        kind: TransferKind,
        key: String,
        error: Option<String>,
    },
}

/// Totals of a finished directory transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirSummary {
    pub files: usize,
    pub folders: usize,
}

/// Remote tree flattened before any file is fetched
#[derive(Default)]
struct RemoteWalk {
    jobs: Vec<FileJob>,
    folders: usize,
    /// Zero-size files already created locally
    empty: usize,
}

struct FileJob {
    target: PathBuf,
    hash: ContentHash,
    size: u64,
}

pub struct ClientEngine {
    ctx: TransferContext,
    uploader: Uploader,
    downloader: Downloader,
    /// Gate for every file transfer
    files: Controller,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl ClientEngine {
    pub fn new(
        config: ClientConfig,
        tracker: Arc<dyn Tracker>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let files = Controller::new(config.file_concurrency, shutdown.child_token());
        let ctx = TransferContext::new(config, tracker, transport, shutdown);
        Ok(Self {
            uploader: Uploader::new(ctx.clone()),
            downloader: Downloader::new(ctx.clone()),
            files,
            ctx,
            events: None,
        })
    }

    /// Create an engine that reports done and progress events on a channel
    pub fn with_events(
        config: ClientConfig,
        tracker: Arc<dyn Tracker>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(Self, mpsc::Receiver<TransferEvent>)> {
        let (tx, rx) = mpsc::channel(100);
        let mut engine = Self::new(config, tracker, transport)?;
        engine.events = Some(tx);
        Ok((engine, rx))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub fn ledger(&self) -> Arc<ProgressLedger> {
        self.ctx.ledger.clone()
    }

    pub async fn upload_file(&self, path: &Path, parent: &str) -> Result<UploadOutcome> {
        let result = match self.files.acquire().await {
            Ok(_slot) => self.uploader.upload_file(path, parent).await,
            Err(e) => Err(e),
        };
        emit_done(&self.events, TransferKind::Upload, unit_key(path), &result).await;
        result
    }

    /// Upload the tree under `dir` as `parent/<dir name>`
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub async fn upload_dir(&self, dir: &Path, parent: &str) -> Result<DirSummary> {
        self.ctx.ensure_running()?;
        let root_name = file_name_of(dir)?;
        let remote_root = join_remote(parent, &root_name);
        let (folders, files) = walk_local(dir).await?;
        info!(
            folders = folders.len(),
            files = files.len(),
            remote = %remote_root,
            "Uploading directory"
        );

        self.make_folder(parent, &root_name).await?;
        for folder in &folders {
            let (remote_parent, name) = remote_location(&remote_root, folder);
            self.make_folder(&remote_parent, &name).await?;
        }

        let handles: Vec<_> = files
            .iter()
            .map(|rel| {
                let uploader = self.uploader.clone();
                let events = self.events.clone();
                let path = dir.join(rel);
                let (remote_parent, _) = remote_location(&remote_root, rel);
                self.files.spawn(async move {
                    let result = uploader.upload_file(&path, &remote_parent).await;
                    emit_done(&events, TransferKind::Upload, unit_key(&path), &result).await;
                    result.map(|_| path)
                })
            })
            .collect();

        let files = finish_batch(Controller::join(handles).await, "upload")?;
        Ok(DirSummary {
            files,
            folders: folders.len() + 1,
        })
    }

    pub async fn download_file(
        &self,
        file_hash: ContentHash,
        file_size: u64,
        dest: &Path,
    ) -> Result<DownloadOutcome> {
        let result = match self.files.acquire().await {
            Ok(_slot) => self.downloader.download_file(file_hash, file_size, dest).await,
            Err(e) => Err(e),
        };
        emit_done(&self.events, TransferKind::Download, unit_key(dest), &result).await;
        result
    }

    /// Mirror the remote folder `remote` into `local`
    #[instrument(skip(self), fields(local = %local.display()))]
    pub async fn download_dir(&self, remote: &str, local: &Path) -> Result<DirSummary> {
        self.ctx.ensure_running()?;
        let walk = self.walk_remote(remote, local).await?;
        info!(
            files = walk.jobs.len() + walk.empty,
            folders = walk.folders,
            "Downloading directory"
        );

        let handles: Vec<_> = walk
            .jobs
            .into_iter()
            .map(|job| {
                let downloader = self.downloader.clone();
                let events = self.events.clone();
                self.files.spawn(async move {
                    let result = downloader
                        .download_file(job.hash, job.size, &job.target)
                        .await;
                    emit_done(&events, TransferKind::Download, unit_key(&job.target), &result)
                        .await;
                    result.map(|_| job.target)
                })
            })
            .collect();
        let files = finish_batch(Controller::join(handles).await, "download")?;
        Ok(DirSummary {
            files: files + walk.empty,
            folders: walk.folders,
        })
    }

    /// List the whole remote tree and create its local folders
    ///
    /// Nothing is downloaded here, so a failed listing leaves no transfer running.
    async fn walk_remote(&self, remote: &str, local: &Path) -> Result<RemoteWalk> {
        let tracker = self.ctx.tracker.clone();
        let page_size = self.ctx.config.list_page_size;
        let mut walk = RemoteWalk::default();
        let mut stack = vec![(remote.to_string(), local.to_path_buf())];

        while let Some((remote_dir, local_dir)) = stack.pop() {
            tokio::fs::create_dir_all(&local_dir).await?;
            walk.folders += 1;
            let mut page = 1;
            loop {
                let entries = with_fresh_credentials(tracker.as_ref(), "list_directory", || {
                    tracker.list_directory(&remote_dir, page, page_size)
                })
                .await?;
                let count = entries.len();
                for entry in entries {
                    let target = local_dir.join(&entry.name);
                    if entry.is_folder {
                        stack.push((join_remote(&remote_dir, &entry.name), target));
                        continue;
                    }
                    let Some(hash) = entry.hash else {
                        warn!(name = %entry.name, "Remote file has no hash, skipping");
                        continue;
                    };
                    if entry.size == 0 {
                        tokio::fs::File::create(&target).await?;
                        walk.empty += 1;
                        emit_done(&self.events, TransferKind::Download, unit_key(&target), &Ok(()))
                            .await;
                        continue;
                    }
                    walk.jobs.push(FileJob {
                        target,
                        hash,
                        size: entry.size,
                    });
                }
                if count < page_size {
                    break;
                }
                page += 1;
            }
        }
        Ok(walk)
    }

    /// Completion ratio per unit; every known unit when `units` is empty
    pub fn get_progress(&self, units: &[String]) -> HashMap<String, f64> {
        self.ctx.ledger.progress(units)
    }

    /// Periodically drain the ledger onto the event channel until shutdown.
    ///
    /// Returns `None` for engines built without an event channel.
    pub fn spawn_progress_reporter(&self) -> Option<JoinHandle<()>> {
        let tx = self.events.clone()?;
        let ledger = self.ctx.ledger.clone();
        let shutdown = self.ctx.shutdown.clone();
        let period = self.ctx.config.progress_interval();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for message in ledger.drain_unsent() {
                            if tx.send(TransferEvent::Progress(message)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!("Progress reporter stopped");
        }))
    }

    /// Cancel all outstanding work and wait for it to release
    pub async fn shutdown(&self) {
        info!(outstanding = self.files.outstanding(), "Shutting down transfer engine");
        self.ctx.shutdown.cancel();
        self.files.wait_all().await;
        info!("Transfer engine stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    async fn make_folder(&self, parent: &str, name: &str) -> Result<()> {
        let tracker = self.ctx.tracker.clone();
        with_fresh_credentials(tracker.as_ref(), "make_folder", || {
            tracker.make_folder(parent, name)
        })
        .await
    }
}

async fn emit_done<T>(
    events: &Option<mpsc::Sender<TransferEvent>>,
    kind: TransferKind,
    key: String,
    result: &Result<T>,
) {
    if let Some(tx) = events {
        let _ = tx
            .send(TransferEvent::Done {
                kind,
                key,
                error: result.as_ref().err().map(|e| e.to_string()),
            })
            .await;
    }
}

/// Log every failure and surface the first one
fn finish_batch(results: Vec<Result<PathBuf>>, operation: &str) -> Result<usize> {
    let total = results.len();
    let mut done = 0usize;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(path) => {
                debug!(file = %path.display(), "{} finished", operation);
                done += 1;
            }
            Err(e) => {
                error!(error = %e, "{} failed", operation);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => {
            error!(failed = total - done, total, "Directory {} incomplete", operation);
            Err(e)
        }
        None => Ok(done),
    }
}

/// Folders (parents first) and files under `root`, relative to it
async fn walk_local(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut folders = Vec::new();
    let mut files = Vec::new();
    let mut stack = vec![PathBuf::new()];

    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&current)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let rel = current.join(entry.file_name());

            if file_type.is_dir() {
                folders.push(rel.clone());
                stack.push(rel);
            } else if file_type.is_file() {
                files.push(rel);
            }
        }
    }

    files.sort();
    Ok((folders, files))
}

/// Remote parent folder and name of the relative local path `rel`
fn remote_location(remote_root: &str, rel: &Path) -> (String, String) {
    let mut parent = remote_root.to_string();
    let mut parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let name = parts.pop().unwrap_or_default();
    for part in parts {
        parent = join_remote(&parent, &part);
    }
    (parent, name)
}
