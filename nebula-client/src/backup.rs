//! Backup peer substitution
//!
//! Spare peers are indexed by every hash they are authorized to hold. Choosing
//! a backup for a hash marks that peer used for the rest of the run, so one
//! spare never stands in for two failed primaries.

use crate::peer::PeerCandidate;
use nebula_core::ContentHash;
use std::collections::HashMap;

#[derive(Debug)]
struct BackupSlot {
    peer: PeerCandidate,
    used: bool,
}

/// hash -> ordered backup peers, with a used-bit per peer
#[derive(Debug, Default)]
pub struct BackupIndex {
    slots: Vec<BackupSlot>,
    by_hash: HashMap<ContentHash, Vec<usize>>,
}

impl BackupIndex {
    pub fn build(backups: Vec<PeerCandidate>) -> Self {
        let mut by_hash: HashMap<ContentHash, Vec<usize>> = HashMap::new();
        for (i, peer) in backups.iter().enumerate() {
            for grant in &peer.grants {
                let slots = by_hash.entry(grant.hash).or_default();
                if !slots.contains(&i) {
                    slots.push(i);
                }
            }
        }
        Self {
            slots: backups
                .into_iter()
                .map(|peer| BackupSlot { peer, used: false })
                .collect(),
            by_hash,
        }
    }

    /// First unused backup authorized for `hash`, marked used
    pub fn choose(&mut self, hash: &ContentHash) -> Option<PeerCandidate> {
        let candidates = self.by_hash.get(hash)?;
        let index = candidates.iter().copied().find(|i| !self.slots[*i].used)?;
        let slot = &mut self.slots[index];
        slot.used = true;
        Some(slot.peer.clone())
    }

    /// Backups not yet handed out
    pub fn remaining(&self) -> usize {
        self.slots.iter().filter(|s| !s.used).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
