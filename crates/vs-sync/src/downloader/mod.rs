//! Swarm downloader.
//!
//! Tracks every chunk we want but do not have, which peers advertise it,
//! and the block requests in flight. `maintain_requests` is the only place
//! requests are issued; it runs on a timer so bursts of peer events
//! coalesce into one scheduling pass.
//!
//! Locking: the folder-level `state` mutex may be held while locking a
//! single `DownloadChunk`, never the other way round.

pub mod chunk;
pub mod queue;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use vs_core::config::DownloaderConfig;
use vs_core::{CtHash, VaultError, VaultResult};
use vs_crypto::{ciphertext_len, PathRevision, SignedMeta};
use vs_storage::{ChunkStorage, Index};

use crate::remote::{InterestGuard, RemoteFolder, RemoteId};
use chunk::DownloadChunk;
use queue::WeightedChunkQueue;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Chunk fully received, verified, and handed to chunk storage
    ChunkDownloaded(CtHash),
}

#[derive(Default)]
struct State {
    remotes: HashMap<RemoteId, Arc<dyn RemoteFolder>>,
    guards: HashMap<RemoteId, Weak<InterestGuard>>,
    chunks: HashMap<CtHash, Arc<Mutex<DownloadChunk>>>,
    queue: WeightedChunkQueue,
}

impl State {
    fn interest_guard(&mut self, remote: &Arc<dyn RemoteFolder>) -> Arc<InterestGuard> {
        let id = remote.id();
        if let Some(guard) = self.guards.get(&id).and_then(Weak::upgrade) {
            return guard;
        }
        let guard = InterestGuard::new(remote.clone());
        self.guards.insert(id, Arc::downgrade(&guard));
        guard
    }

    fn remove_chunk(&mut self, ct_hash: &CtHash) -> bool {
        if self.chunks.remove(ct_hash).is_some() {
            self.queue.remove_chunk(ct_hash);
            debug!(%ct_hash, "removed from download queue");
            true
        } else {
            false
        }
    }
}

pub struct Downloader {
    config: DownloaderConfig,
    dir: PathBuf,
    index: Arc<Index>,
    storage: Arc<ChunkStorage>,
    state: Mutex<State>,
    events: broadcast::Sender<DownloadEvent>,
}

impl Downloader {
    /// Partial downloads live in `{system_path}/downloads` and do not
    /// survive a restart.
    pub fn new(
        system_path: &Path,
        config: &DownloaderConfig,
        index: Arc<Index>,
        storage: Arc<ChunkStorage>,
    ) -> VaultResult<Self> {
        let dir = system_path.join("downloads");
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(Downloader {
            config: config.clone(),
            dir,
            index,
            storage,
            state: Mutex::new(State::default()),
            events: broadcast::channel(EVENT_CAPACITY).0,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub fn is_downloading(&self, ct_hash: &CtHash) -> bool {
        self.state.lock().chunks.contains_key(ct_hash)
    }

    pub fn pending_chunks(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Chunks in the order they will be requested.
    pub fn queue_order(&self) -> Vec<CtHash> {
        self.state.lock().queue.chunks()
    }

    /// Register which chunks of an accepted meta we already hold.
    pub fn notify_local_meta(&self, smeta: &SignedMeta, bitfield: &[bool]) -> VaultResult<()> {
        let chunks = &smeta.meta().chunks;
        if bitfield.len() != chunks.len() {
            return Err(VaultError::ProtocolViolation(format!(
                "bitfield of {} bits for {} chunks of {}",
                bitfield.len(),
                chunks.len(),
                smeta.path_revision()
            )));
        }
        let sizes = chunks
            .iter()
            .map(|info| {
                ciphertext_len(info.size).ok_or_else(|| {
                    VaultError::ProtocolViolation(format!(
                        "chunk {} of {} declares {} bytes",
                        info.ct_hash,
                        smeta.path_revision(),
                        info.size
                    ))
                })
            })
            .collect::<VaultResult<Vec<u32>>>()?;

        let mut incomplete = Vec::new();
        let mut have_complete = false;
        {
            let mut state = self.state.lock();
            for ((info, have), size) in chunks.iter().zip(bitfield).zip(sizes) {
                if *have {
                    have_complete = true;
                    state.remove_chunk(&info.ct_hash);
                } else {
                    if !state.chunks.contains_key(&info.ct_hash) {
                        let chunk = DownloadChunk::new(&self.dir, info.ct_hash, size);
                        state.chunks.insert(info.ct_hash, Arc::new(Mutex::new(chunk)));
                        state.queue.add_chunk(info.ct_hash);
                        debug!(ct_hash = %info.ct_hash, size, "added to download queue");
                    }
                    incomplete.push(info.ct_hash);
                }
            }
        }

        // Partially present file: finish it before starting others
        if have_complete && !incomplete.is_empty() {
            let cluster = self.meta_cluster(&incomplete);
            let mut state = self.state.lock();
            for ct_hash in &cluster {
                state.queue.mark_clustered(ct_hash);
            }
        }
        Ok(())
    }

    /// A chunk arrived locally by any route.
    pub fn notify_local_chunk(&self, ct_hash: &CtHash) {
        let cluster = self.cluster(ct_hash);
        let mut state = self.state.lock();
        state.remove_chunk(ct_hash);
        for other in &cluster {
            state.queue.mark_clustered(other);
        }
    }

    /// Every chunk of every meta that contains `ct_hash`.
    fn cluster(&self, ct_hash: &CtHash) -> HashSet<CtHash> {
        self.index
            .containing_chunk(ct_hash)
            .iter()
            .flat_map(|smeta| smeta.meta().chunks.iter().map(|c| c.ct_hash))
            .collect()
    }

    fn meta_cluster(&self, ct_hashes: &[CtHash]) -> HashSet<CtHash> {
        ct_hashes.iter().flat_map(|h| self.cluster(h)).collect()
    }

    /// A peer holds `revision` with the chunks marked in `bitfield`.
    pub fn notify_remote_meta(
        &self,
        remote: RemoteId,
        revision: &PathRevision,
        bitfield: &[bool],
    ) -> VaultResult<()> {
        let smeta = match self.index.get_meta(revision) {
            Ok(smeta) => smeta,
            Err(e) if e.is_not_found() => {
                debug!(%remote, %revision, "announced meta is not current here");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let chunks = &smeta.meta().chunks;
        if chunks.len() != bitfield.len() {
            return Err(VaultError::ProtocolViolation(format!(
                "{remote} announced {} bits for {} chunks of {revision}",
                bitfield.len(),
                chunks.len()
            )));
        }
        for (info, _) in chunks.iter().zip(bitfield).filter(|(_, have)| **have) {
            self.notify_remote_chunk(remote, &info.ct_hash);
        }
        Ok(())
    }

    /// A peer can serve `ct_hash`.
    pub fn notify_remote_chunk(&self, remote: RemoteId, ct_hash: &CtHash) {
        let mut state = self.state.lock();
        let Some(chunk) = state.chunks.get(ct_hash).cloned() else {
            return;
        };
        let Some(handle) = state.remotes.get(&remote).cloned() else {
            debug!(%remote, %ct_hash, "chunk announcement from untracked remote");
            return;
        };
        let guard = state.interest_guard(&handle);
        let owners = {
            let mut c = chunk.lock();
            c.owned_by.insert(remote, guard);
            c.owned_by.len()
        };
        state.queue.set_owner_count(ct_hash, owners);
        trace!(%remote, %ct_hash, owners, "chunk owner recorded");
    }

    /// Requests to a choking peer will not be answered; free their ranges.
    pub fn handle_choke(&self, remote: RemoteId) {
        let state = self.state.lock();
        let released: usize = state
            .chunks
            .values()
            .map(|c| c.lock().release_remote(remote))
            .sum();
        debug!(%remote, released, "choked");
    }

    pub fn handle_unchoke(&self, remote: RemoteId) {
        debug!(%remote, "unchoked");
    }

    pub fn track_remote(&self, remote: Arc<dyn RemoteFolder>) {
        let mut state = self.state.lock();
        let id = remote.id();
        if state.remotes.insert(id, remote).is_some() {
            warn!(remote = %id, "remote tracked twice");
        }
        let count = state.remotes.len();
        state.queue.set_peer_count(count);
        debug!(remote = %id, peers = count, "remote tracked");
    }

    /// Forget a peer: its requests, ownership records, and interest.
    pub fn untrack_remote(&self, remote: RemoteId) {
        let mut state = self.state.lock();
        let mut owners = Vec::new();
        for (ct_hash, chunk) in &state.chunks {
            let mut c = chunk.lock();
            let owned = c.owned_by.contains_key(&remote);
            c.forget_remote(remote);
            if owned {
                owners.push((*ct_hash, c.owned_by.len()));
            }
        }
        for (ct_hash, count) in owners {
            state.queue.set_owner_count(&ct_hash, count);
        }
        state.guards.remove(&remote);
        state.remotes.remove(&remote);
        let count = state.remotes.len();
        state.queue.set_peer_count(count);
        debug!(%remote, peers = count, "remote untracked");
    }

    /// The user is waiting on this entry.
    pub fn mark_immediate(&self, smeta: &SignedMeta) {
        let mut state = self.state.lock();
        for info in &smeta.meta().chunks {
            state.queue.mark_immediate(&info.ct_hash);
        }
    }

    /// Expire stale requests and issue new ones up to the slot limits.
    ///
    /// Returns the number of requests sent.
    pub fn maintain_requests(&self) -> usize {
        let timeout = self.config.request_timeout();
        let slots = self.config.download_slots;
        let per_chunk = self.config.max_requests_per_chunk.max(1);
        let block_size = self.config.block_size;
        let now = Instant::now();

        let mut state = self.state.lock();

        let unreferenced: Vec<CtHash> = state
            .chunks
            .keys()
            .filter(|h| !self.index.is_referenced(h))
            .copied()
            .collect();
        for ct_hash in &unreferenced {
            state.remove_chunk(ct_hash);
        }

        let mut outstanding: HashMap<RemoteId, usize> = HashMap::new();
        let mut in_flight = 0usize;
        for chunk in state.chunks.values() {
            let mut c = chunk.lock();
            for remote in c.expire_requests(now, timeout) {
                debug!(ct_hash = %c.ct_hash, %remote, "request timed out");
            }
            for req in &c.requests {
                *outstanding.entry(req.remote).or_default() += 1;
                in_flight += 1;
            }
        }

        let order = state.queue.chunks();
        let mut issued = 0;
        while in_flight < slots {
            let mut progressed = false;
            for ct_hash in &order {
                if in_flight >= slots {
                    break;
                }
                let Some(chunk) = state.chunks.get(ct_hash) else {
                    continue;
                };
                let mut c = chunk.lock();
                if c.requests.len() >= per_chunk {
                    continue;
                }
                let Some((offset, size)) = c.next_request_range(block_size) else {
                    continue;
                };
                let Some(remote) = pick_remote(&state.remotes, &c, &outstanding) else {
                    continue;
                };
                let id = remote.id();
                c.add_request(id, offset, size, now);
                remote.send_block_request(*ct_hash, offset, size);
                trace!(%ct_hash, remote = %id, offset, size, "block requested");

                *outstanding.entry(id).or_default() += 1;
                in_flight += 1;
                issued += 1;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        if issued > 0 {
            debug!(issued, in_flight, pending = state.chunks.len(), "requests maintained");
        }
        issued
    }

    /// Accept a block from `from`.
    ///
    /// Returns `Ok(true)` when this block completed and stored the chunk.
    /// Blocks for chunks we no longer want, ranges already received, and
    /// blocks from untracked peers are ignored. Ranges outside the chunk,
    /// and blocks from a peer that neither owns the chunk nor was asked
    /// for the range, are a protocol violation.
    pub fn put_block(
        &self,
        ct_hash: &CtHash,
        offset: u32,
        data: &[u8],
        from: RemoteId,
    ) -> VaultResult<bool> {
        let (chunk, tracked) = {
            let state = self.state.lock();
            (state.chunks.get(ct_hash).cloned(), state.remotes.contains_key(&from))
        };
        let Some(chunk) = chunk else {
            trace!(%ct_hash, remote = %from, "block for chunk not in download");
            return Ok(false);
        };

        let mut c = chunk.lock();
        let end = offset as u64 + data.len() as u64;
        if data.is_empty() || end > c.size as u64 {
            return Err(VaultError::ProtocolViolation(format!(
                "{from} sent block {offset}+{} outside chunk {ct_hash} of {} bytes",
                data.len(),
                c.size
            )));
        }

        if !tracked {
            debug!(%ct_hash, remote = %from, "block from untracked remote ignored");
            return Ok(false);
        }

        let requested = c.complete_request(from, offset, data.len() as u32);
        if !requested && !c.owned_by.contains_key(&from) {
            return Err(VaultError::ProtocolViolation(format!(
                "{from} sent unsolicited block {offset}+{} of chunk {ct_hash}",
                data.len()
            )));
        }
        if let Err(e) = c.builder.put_block(offset, data)? {
            debug!(%ct_hash, remote = %from, requested, "block not accepted: {e}");
            return Ok(false);
        }
        c.contributors.insert(from);
        if !c.builder.complete() {
            return Ok(false);
        }

        let actual = c.builder.ct_hash()?;
        if actual != *ct_hash {
            let blamed = c.discard_assembly();
            warn!(%ct_hash, %actual, ?blamed, "assembled chunk failed verification, refetching");
            return Ok(false);
        }

        self.storage.put_file(ct_hash, c.builder.path())?;
        drop(c);
        self.state.lock().remove_chunk(ct_hash);
        info!(%ct_hash, "chunk downloaded");
        let _ = self.events.send(DownloadEvent::ChunkDownloaded(*ct_hash));
        Ok(true)
    }
}

/// Ready, unchoked owner of the chunk, ranked by
/// `(failed assemblies, timeouts, outstanding requests)`, lowest first.
fn pick_remote(
    remotes: &HashMap<RemoteId, Arc<dyn RemoteFolder>>,
    chunk: &DownloadChunk,
    outstanding: &HashMap<RemoteId, usize>,
) -> Option<Arc<dyn RemoteFolder>> {
    chunk
        .owned_by
        .keys()
        .filter_map(|id| remotes.get(id))
        .filter(|r| r.ready() && !r.peer_choking())
        .min_by_key(|r| {
            let id = r.id();
            (
                chunk.failures.get(&id).copied().unwrap_or(0),
                chunk.timeouts.get(&id).copied().unwrap_or(0),
                outstanding.get(&id).copied().unwrap_or(0),
                id,
            )
        })
        .cloned()
}
