//! Peer probing and selection
//!
//! Latency is measured with a bounded liveness call per peer. All probes of a
//! batch run concurrently and the batch completes only when every probe has.

use crate::peer::{Latency, PeerAddr, PeerCandidate, RankedPeer};
use crate::transport::PeerTransport;
use futures::future::join_all;
use nebula_core::{NebulaError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

pub struct Prober {
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl Prober {
    pub fn new(transport: Arc<dyn PeerTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Round-trip time of one liveness call, or `Unreachable`
    pub async fn probe(&self, addr: &PeerAddr) -> Latency {
        let start = Instant::now();
        match timeout(self.timeout, self.transport.ping(addr)).await {
            Ok(Ok(())) => Latency::from_elapsed(start.elapsed()),
            Ok(Err(e)) => {
                debug!(peer = %addr, error = %e, "Ping failed");
                Latency::Unreachable
            }
            Err(_) => {
                debug!(peer = %addr, timeout = ?self.timeout, "Ping timed out");
                Latency::Unreachable
            }
        }
    }

    /// Probe every peer and sort ascending by latency, stable on input order
    pub async fn rank(&self, peers: &[PeerCandidate]) -> Vec<RankedPeer> {
        let latencies = join_all(peers.iter().map(|p| self.probe(&p.addr))).await;
        let mut ranked: Vec<RankedPeer> = peers
            .iter()
            .cloned()
            .zip(latencies)
            .enumerate()
            .map(|(origin_index, (peer, latency))| RankedPeer {
                peer,
                latency,
                origin_index,
            })
            .collect();
        ranked.sort_by_key(|r| r.latency);
        ranked
    }

    /// Split reachable peers into `desired` primaries and the rest as backups.
    ///
    /// Fails when fewer than `minimum` peers answer.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn rank_replica_peers(
        &self,
        candidates: &[PeerCandidate],
        desired: usize,
        minimum: usize,
    ) -> Result<(Vec<RankedPeer>, Vec<RankedPeer>)> {
        let mut reachable = self.rank(candidates).await;
        let total = reachable.len();
        reachable.retain(|r| r.latency.is_reachable());
        if reachable.len() < total {
            warn!(
                unreachable = total - reachable.len(),
                "Dropping unreachable replica peers"
            );
        }

        if reachable.len() < minimum {
            return Err(NebulaError::InsufficientPeers {
                reachable: reachable.len(),
                required: minimum,
            });
        }

        let backup = reachable.split_off(desired.min(reachable.len()));
        Ok((reachable, backup))
    }

    /// Fastest reachable node, ties broken by input order
    pub async fn pick_fastest(&self, nodes: &[PeerCandidate]) -> Option<RankedPeer> {
        self.rank(nodes)
            .await
            .into_iter()
            .find(|r| r.latency.is_reachable())
    }
}

/// Split by the tracker-assigned spare flag, preserving order
pub fn partition_spare_vs_active(
    candidates: Vec<PeerCandidate>,
) -> (Vec<PeerCandidate>, Vec<PeerCandidate>) {
    candidates.into_iter().partition(|p| !p.spare)
}
