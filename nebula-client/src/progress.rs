//! Progress accounting
//!
//! Every physical transfer unit (a shard, a partition or a whole file) has an
//! entry keyed by name. Units can be mapped onto a logical origin so shard
//! progress rolls up into the file the caller asked for.

use chrono::Utc;
use nebula_core::{NebulaError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
}

/// Byte counters for one unit
#[derive(Debug, Clone)]
pub struct ProgressEntry {
    pub kind: TransferKind,
    pub total: u64,
    pub transferred: u64,
    /// Unix seconds of the last update
    pub updated_at: i64,
    /// Completion message already drained
    pub completion_sent: bool,
    pub local: Option<PathBuf>,
}

impl ProgressEntry {
    /// Completion ratio, floored to two decimals and capped at 1.0
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let percent = self.transferred.min(self.total) as u128 * 100 / self.total as u128;
        percent as f64 / 100.0
    }
}

/// Snapshot emitted by `drain_unsent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    #[serde(rename = "type")]
    pub kind: TransferKind,
    pub key: String,
    pub local: Option<PathBuf>,
    pub progress: f64,
    pub done: bool,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<String, ProgressEntry>,
    origins: HashMap<String, String>,
}

/// Concurrency-safe progress map
#[derive(Default)]
pub struct ProgressLedger {
    state: Mutex<LedgerState>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or reset the entry for `unit`
    pub fn track(&self, unit: &str, kind: TransferKind, total: u64, local: Option<PathBuf>) {
        let mut state = self.state.lock();
        state.entries.insert(
            unit.to_string(),
            ProgressEntry {
                kind,
                total,
                transferred: 0,
                updated_at: Utc::now().timestamp(),
                completion_sent: false,
                local,
            },
        );
    }

    /// Change the expected byte count of an existing unit
    pub fn set_total(&self, unit: &str, total: u64) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(unit)
            .ok_or_else(|| NebulaError::UnknownProgressUnit(unit.to_string()))?;
        entry.total = total;
        entry.updated_at = Utc::now().timestamp();
        Ok(())
    }

    /// Fold `physical` into `logical`
    pub fn map_to_origin(&self, physical: &str, logical: &str) {
        self.state
            .lock()
            .origins
            .insert(physical.to_string(), logical.to_string());
    }

    /// Record `delta` more bytes for `unit` (or the origin it maps to)
    pub fn add_bytes(&self, unit: &str, delta: u64) -> Result<()> {
        let mut state = self.state.lock();
        let key = state
            .origins
            .get(unit)
            .cloned()
            .unwrap_or_else(|| unit.to_string());
        let entry = state
            .entries
            .get_mut(&key)
            .ok_or(NebulaError::UnknownProgressUnit(key))?;
        entry.transferred = entry.transferred.saturating_add(delta);
        entry.updated_at = Utc::now().timestamp();
        Ok(())
    }

    /// Mark a unit fully transferred
    pub fn complete(&self, unit: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(unit)
            .ok_or_else(|| NebulaError::UnknownProgressUnit(unit.to_string()))?;
        entry.transferred = entry.total;
        entry.updated_at = Utc::now().timestamp();
        Ok(())
    }

    pub fn rate(&self, unit: &str) -> Option<f64> {
        self.state.lock().entries.get(unit).map(|e| e.rate())
    }

    pub fn entry(&self, unit: &str) -> Option<ProgressEntry> {
        self.state.lock().entries.get(unit).cloned()
    }

    /// Rates for the named units; every unit when `units` is empty
    pub fn progress(&self, units: &[String]) -> HashMap<String, f64> {
        let state = self.state.lock();
        if units.is_empty() {
            return state
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.rate()))
                .collect();
        }
        units
            .iter()
            .filter_map(|u| state.entries.get(u).map(|e| (u.clone(), e.rate())))
            .collect()
    }

    /// Progress for every unfinished unit, plus one completion message for
    /// each unit that reached 1.0 since the last drain
    pub fn drain_unsent(&self) -> Vec<ProgressMessage> {
        let mut state = self.state.lock();
        let mut messages = Vec::new();
        for (key, entry) in state.entries.iter_mut() {
            if entry.completion_sent {
                continue;
            }
            let rate = entry.rate();
            let done = rate >= 1.0;
            if done {
                entry.completion_sent = true;
            }
            messages.push(ProgressMessage {
                kind: entry.kind,
                key: key.clone(),
                local: entry.local.clone(),
                progress: rate,
                done,
            });
        }
        messages.sort_by(|a, b| a.key.cmp(&b.key));
        messages
    }
}

/// Handle passed to transports for reporting bytes of one unit
#[derive(Clone)]
pub struct ProgressSink {
    ledger: Arc<ProgressLedger>,
    unit: String,
}

impl ProgressSink {
    pub fn new(ledger: Arc<ProgressLedger>, unit: impl Into<String>) -> Self {
        Self {
            ledger,
            unit: unit.into(),
        }
    }

    pub fn advance(&self, bytes: u64) {
        if let Err(e) = self.ledger.add_bytes(&self.unit, bytes) {
            debug!(unit = %self.unit, error = %e, "Dropped progress update");
        }
    }
}
