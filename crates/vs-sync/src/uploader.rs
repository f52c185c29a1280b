//! Serving our chunks to peers.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use vs_core::{CtHash, VaultError, VaultResult};
use vs_storage::ChunkStorage;

use crate::remote::RemoteFolder;

pub struct Uploader {
    storage: Arc<ChunkStorage>,
}

impl Uploader {
    pub fn new(storage: Arc<ChunkStorage>) -> Self {
        Uploader { storage }
    }

    /// Tell every ready peer about a chunk we just got.
    pub fn broadcast_chunk(&self, remotes: &[Arc<dyn RemoteFolder>], ct_hash: &CtHash) {
        for remote in remotes.iter().filter(|r| r.ready()) {
            remote.send_have_chunk(*ct_hash);
        }
    }

    // No upload slot limit: every interested peer is unchoked.
    pub fn handle_interested(&self, remote: &dyn RemoteFolder) {
        trace!(remote = %remote.id(), "peer interested, unchoking");
        remote.send_unchoke();
    }

    pub fn handle_not_interested(&self, remote: &dyn RemoteFolder) {
        trace!(remote = %remote.id(), "peer not interested, choking");
        remote.send_choke();
    }

    /// Answer a block request. Returns whether a block was sent.
    pub fn handle_block_request(
        &self,
        remote: &dyn RemoteFolder,
        ct_hash: &CtHash,
        offset: u32,
        length: u32,
    ) -> VaultResult<bool> {
        if remote.am_choking() || !remote.peer_interested() {
            debug!(remote = %remote.id(), %ct_hash, "block request from choked or uninterested peer");
            return Ok(false);
        }
        let chunk = match self.storage.get(ct_hash) {
            Ok(chunk) => chunk,
            Err(VaultError::NoSuchChunk(_)) => {
                warn!(remote = %remote.id(), %ct_hash, "requested chunk not available");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let start = offset as usize;
        let end = start + length as usize;
        if length == 0 || end > chunk.len() {
            return Err(VaultError::ProtocolViolation(format!(
                "{} requested {offset}+{length} of chunk {ct_hash} ({} bytes)",
                remote.id(),
                chunk.len()
            )));
        }
        remote.send_block(*ct_hash, offset, chunk[start..end].to_vec());
        Ok(true)
    }
}
