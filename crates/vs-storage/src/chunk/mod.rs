//! Tiered content-addressed chunk storage.
//!
//! Lookups go memory → encrypted → open. The open tier only exists when
//! the secret can decrypt; otherwise the folder is a two-tier blind
//! replica that never touches plaintext.

pub mod enc;
pub mod memory;
pub mod open;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};
use vs_core::config::StorageConfig;
use vs_core::{Bitfield, CtHash, VaultError, VaultResult};
use vs_crypto::{compute_ct_hash, MetaInfo, Secret};

use crate::index::Index;
use enc::EncStorage;
use memory::MemoryStorage;
use open::OpenStorage;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A verified chunk became available locally
    ChunkAdded(CtHash),
}

enum Tiers {
    TwoTier,
    ThreeTier(OpenStorage),
}

pub struct ChunkStorage {
    mem: MemoryStorage,
    enc: EncStorage,
    tiers: Tiers,
    index: Arc<Index>,
    events: broadcast::Sender<ChunkEvent>,
}

impl ChunkStorage {
    pub fn new(
        root: &Path,
        system_path: &Path,
        secret: &Secret,
        index: Arc<Index>,
        config: &StorageConfig,
    ) -> VaultResult<Self> {
        let enc = EncStorage::new(system_path.join("chunks"), config.io_retries)?;
        let tiers = if secret.can_decrypt() {
            Tiers::ThreeTier(OpenStorage::new(
                PathBuf::from(root),
                secret.clone(),
                index.clone(),
            ))
        } else {
            Tiers::TwoTier
        };
        info!(
            path = %system_path.display(),
            tiers = if matches!(tiers, Tiers::ThreeTier(_)) { 3 } else { 2 },
            mem_cache_chunks = config.mem_cache_chunks,
            "chunk storage ready"
        );
        Ok(ChunkStorage {
            mem: MemoryStorage::new(config.mem_cache_chunks),
            enc,
            tiers,
            index,
            events: broadcast::channel(EVENT_CAPACITY).0,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChunkEvent> {
        self.events.subscribe()
    }

    pub fn have(&self, ct_hash: &CtHash) -> bool {
        if self.mem.have(ct_hash) || self.enc.have(ct_hash) {
            return true;
        }
        match &self.tiers {
            Tiers::ThreeTier(open) => open.have(ct_hash),
            Tiers::TwoTier => false,
        }
    }

    /// Ciphertext of `ct_hash`, from the cheapest tier that has it.
    pub fn get(&self, ct_hash: &CtHash) -> VaultResult<Arc<[u8]>> {
        if let Some(data) = self.mem.get(ct_hash) {
            return Ok(data);
        }
        let data = match self.enc.get(ct_hash) {
            Ok(data) => data,
            Err(VaultError::NoSuchChunk(_)) => match &self.tiers {
                Tiers::ThreeTier(open) => open.get(ct_hash)?,
                Tiers::TwoTier => return Err(VaultError::NoSuchChunk(*ct_hash)),
            },
            Err(e) => return Err(e),
        };
        self.mem.put(*ct_hash, data.clone());
        Ok(data)
    }

    /// Store ciphertext after checking it hashes to `ct_hash`.
    pub fn put(&self, ct_hash: &CtHash, data: &[u8]) -> VaultResult<()> {
        let actual = compute_ct_hash(data);
        if actual != *ct_hash {
            return Err(VaultError::Verification(format!(
                "chunk hash mismatch: expected {ct_hash}, got {actual}"
            )));
        }
        self.enc.put(ct_hash, data)?;
        self.emit(ct_hash);
        Ok(())
    }

    /// Move an already verified ciphertext file into encrypted storage.
    pub fn put_file(&self, ct_hash: &CtHash, src: &Path) -> VaultResult<()> {
        self.enc.put_file(ct_hash, src)?;
        self.emit(ct_hash);
        Ok(())
    }

    fn emit(&self, ct_hash: &CtHash) {
        let _ = self.events.send(ChunkEvent::ChunkAdded(*ct_hash));
    }

    /// One entry per chunk of `meta`: whether we can serve it.
    pub fn make_bitfield(&self, meta: &MetaInfo) -> Bitfield {
        meta.chunks.iter().map(|c| self.have(&c.ct_hash)).collect()
    }

    /// Drop encrypted copies that the open tier can now reproduce.
    pub fn prune_assembled(&self, meta: &MetaInfo) -> VaultResult<()> {
        let Tiers::ThreeTier(open) = &self.tiers else {
            return Ok(());
        };
        for chunk in &meta.chunks {
            if self.enc.have(&chunk.ct_hash) && open.have(&chunk.ct_hash) {
                self.enc.remove(&chunk.ct_hash)?;
                debug!(ct_hash = %chunk.ct_hash, "encrypted copy pruned, plaintext assembled");
            }
        }
        Ok(())
    }

    /// Remove a chunk no current meta references.
    pub fn gc_chunk(&self, ct_hash: &CtHash) -> VaultResult<bool> {
        if self.index.is_referenced(ct_hash) {
            return Ok(false);
        }
        self.mem.remove(ct_hash);
        self.enc.remove(ct_hash)?;
        Ok(true)
    }

    /// Prune every assembled entry and collect unreferenced chunks.
    pub fn rebalance(&self) -> VaultResult<()> {
        for smeta in self.index.existing_meta() {
            self.prune_assembled(smeta.meta())?;
        }
        let mut collected = 0usize;
        for ct_hash in self.enc.list()? {
            if self.gc_chunk(&ct_hash)? {
                collected += 1;
            }
        }
        info!(collected, "chunk storage rebalanced");
        Ok(())
    }
}
