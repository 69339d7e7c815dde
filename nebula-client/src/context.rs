//! State shared by the upload and download pipelines

use crate::config::ClientConfig;
use crate::controller::Controller;
use crate::progress::ProgressLedger;
use crate::prober::Prober;
use crate::tracker::Tracker;
use crate::transport::PeerTransport;
use nebula_core::{NebulaError, Result};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Collaborators and shared state for one engine
#[derive(Clone)]
pub struct TransferContext {
    pub config: Arc<ClientConfig>,
    pub tracker: Arc<dyn Tracker>,
    pub transport: Arc<dyn PeerTransport>,
    pub prober: Arc<Prober>,
    pub ledger: Arc<ProgressLedger>,
    /// Process-wide shutdown signal
    pub shutdown: CancellationToken,
}

impl TransferContext {
    pub fn new(
        config: ClientConfig,
        tracker: Arc<dyn Tracker>,
        transport: Arc<dyn PeerTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        let prober = Arc::new(Prober::new(transport.clone(), config.probe_timeout()));
        Self {
            config: Arc::new(config),
            tracker,
            transport,
            prober,
            ledger: Arc::new(ProgressLedger::new()),
            shutdown,
        }
    }

    /// Fresh gate for the shards or replicas of one file
    pub fn block_controller(&self) -> Controller {
        Controller::new(self.config.block_concurrency, self.shutdown.child_token())
    }

    /// Per-transfer scratch directory, removed when dropped
    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        std::fs::create_dir_all(&self.config.temp_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.config.temp_dir)?)
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(NebulaError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Progress key of a local file
pub fn unit_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Run blocking file work off the async runtime
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NebulaError::Internal(format!("blocking task failed: {}", e)))?
}
