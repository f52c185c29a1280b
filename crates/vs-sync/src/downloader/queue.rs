//! Priority order of chunks waiting to be downloaded.
//!
//! Score = clustered bonus + immediate bonus + rarity bonus, where rarity
//! is the share of tracked peers that do *not* advertise the chunk. Equal
//! scores keep discovery order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use vs_core::CtHash;

pub const CLUSTERED_WEIGHT: u32 = 10_000;
pub const IMMEDIATE_WEIGHT: u32 = 20_000;
pub const RARITY_WEIGHT: u32 = 25_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Weight {
    pub clustered: bool,
    pub immediate: bool,
    pub owned_by: usize,
    pub peer_count: usize,
}

impl Weight {
    pub fn score(&self) -> u32 {
        let mut score = 0;
        if self.clustered {
            score += CLUSTERED_WEIGHT;
        }
        if self.immediate {
            score += IMMEDIATE_WEIGHT;
        }
        if self.peer_count > 0 {
            let lacking = self.peer_count.saturating_sub(self.owned_by) as u64;
            score += (RARITY_WEIGHT as u64 * lacking / self.peer_count as u64) as u32;
        }
        score
    }
}

struct Entry {
    weight: Weight,
    seq: u64,
}

#[derive(Default)]
pub struct WeightedChunkQueue {
    entries: HashMap<CtHash, Entry>,
    /// (highest score first, then FIFO)
    order: BTreeSet<(Reverse<u32>, u64, CtHash)>,
    next_seq: u64,
    peer_count: usize,
}

impl WeightedChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, ct_hash: &CtHash) -> bool {
        self.entries.contains_key(ct_hash)
    }

    pub fn add_chunk(&mut self, ct_hash: CtHash) {
        if self.entries.contains_key(&ct_hash) {
            return;
        }
        let weight = Weight {
            peer_count: self.peer_count,
            ..Weight::default()
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((Reverse(weight.score()), seq, ct_hash));
        self.entries.insert(ct_hash, Entry { weight, seq });
    }

    pub fn remove_chunk(&mut self, ct_hash: &CtHash) {
        if let Some(e) = self.entries.remove(ct_hash) {
            self.order.remove(&(Reverse(e.weight.score()), e.seq, *ct_hash));
        }
    }

    fn reweight(&mut self, ct_hash: &CtHash, f: impl FnOnce(&mut Weight)) {
        let Some(e) = self.entries.get_mut(ct_hash) else {
            return;
        };
        self.order.remove(&(Reverse(e.weight.score()), e.seq, *ct_hash));
        f(&mut e.weight);
        self.order.insert((Reverse(e.weight.score()), e.seq, *ct_hash));
    }

    pub fn weight(&self, ct_hash: &CtHash) -> Option<Weight> {
        self.entries.get(ct_hash).map(|e| e.weight)
    }

    /// Number of tracked peers; rescores every chunk.
    pub fn set_peer_count(&mut self, count: usize) {
        self.peer_count = count;
        self.order.clear();
        for (ct_hash, e) in self.entries.iter_mut() {
            e.weight.peer_count = count;
            self.order.insert((Reverse(e.weight.score()), e.seq, *ct_hash));
        }
    }

    /// Number of peers advertising `ct_hash`.
    pub fn set_owner_count(&mut self, ct_hash: &CtHash, owned_by: usize) {
        self.reweight(ct_hash, |w| w.owned_by = owned_by);
    }

    pub fn mark_clustered(&mut self, ct_hash: &CtHash) {
        self.reweight(ct_hash, |w| w.clustered = true);
    }

    pub fn mark_immediate(&mut self, ct_hash: &CtHash) {
        self.reweight(ct_hash, |w| w.immediate = true);
    }

    /// Chunks in request order.
    pub fn chunks(&self) -> Vec<CtHash> {
        self.order.iter().map(|(_, _, h)| *h).collect()
    }
}
