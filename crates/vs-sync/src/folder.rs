//! One synchronized folder: index, chunk storage, and the transfer
//! components wired together, plus the attached peers.
//!
//! Event flow:
//!   - `IndexEvent` → downloader learns what is missing, peers get `have_meta`,
//!     external metas are assembled
//!   - `ChunkEvent` → peers get `have_chunk`, downloader drops the chunk,
//!     metas containing it are assembled
//!   - timer → `Downloader::maintain_requests`
//!
//! Disk and crypto work runs on the blocking pool, bounded by a semaphore.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vs_chunks::{collect_entries, ChunkSizes, Indexer};
use vs_core::config::{FolderConfig, VaultConfig};
use vs_core::{VaultError, VaultResult};
use vs_crypto::{denormalize_path, EntryKind, MetaInfo, Secret, SignedMeta};
use vs_storage::{ChunkEvent, ChunkStorage, FileAssembler, Index, IndexBackendKind, IndexEvent};

use crate::downloader::Downloader;
use crate::messages::PeerMessage;
use crate::meta_transfer::{MetaDownloader, MetaUploader};
use crate::remote::{RemoteFolder, RemoteId};
use crate::uploader::Uploader;

/// Re-assembly of pending metas and storage rebalancing
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

pub struct FolderGroup {
    root: PathBuf,
    system_path: PathBuf,
    secret: Secret,
    index: Arc<Index>,
    storage: Arc<ChunkStorage>,
    downloader: Arc<Downloader>,
    uploader: Arc<Uploader>,
    meta_uploader: MetaUploader,
    meta_downloader: MetaDownloader,
    assembler: Option<Arc<FileAssembler>>,
    indexer: Option<Indexer>,
    remotes: RwLock<HashMap<RemoteId, Arc<dyn RemoteFolder>>>,
    workers: Semaphore,
    maintain_interval: Duration,
}

impl FolderGroup {
    pub fn open(folder: &FolderConfig, config: &VaultConfig) -> VaultResult<Arc<Self>> {
        let secret: Secret = folder.secret.parse()?;
        let root = folder.path.clone();
        let system_path = folder.system_path();
        let backend: IndexBackendKind = config.storage.index_backend.parse()?;

        let index = Arc::new(Index::open(&system_path, &secret, backend)?);
        let storage = Arc::new(ChunkStorage::new(
            &root,
            &system_path,
            &secret,
            index.clone(),
            &config.storage,
        )?);
        let downloader = Arc::new(Downloader::new(
            &system_path,
            &config.downloader,
            index.clone(),
            storage.clone(),
        )?);

        let assembler = if secret.can_decrypt() {
            Some(Arc::new(FileAssembler::new(
                &root,
                &system_path,
                &secret,
                index.clone(),
                storage.clone(),
            )?))
        } else {
            None
        };
        let indexer = if secret.can_sign() {
            Some(Indexer::new(
                secret.clone(),
                &root,
                ChunkSizes::from(&config.indexer),
            )?)
        } else {
            None
        };

        let workers = match config.storage.workers {
            0 => std::thread::available_parallelism().map_or(4, |n| n.get()),
            n => n,
        };

        info!(
            folder_id = %secret.folder_id_hex(),
            path = %root.display(),
            level = ?secret.level(),
            workers,
            "folder opened"
        );

        Ok(Arc::new(FolderGroup {
            meta_uploader: MetaUploader::new(index.clone(), storage.clone()),
            meta_downloader: MetaDownloader::new(index.clone(), storage.clone(), downloader.clone()),
            uploader: Arc::new(Uploader::new(storage.clone())),
            root,
            system_path,
            secret,
            index,
            storage,
            downloader,
            assembler,
            indexer,
            remotes: RwLock::new(HashMap::new()),
            workers: Semaphore::new(workers),
            maintain_interval: config.downloader.maintain_interval(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_id(&self) -> String {
        self.secret.folder_id_hex()
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn storage(&self) -> &Arc<ChunkStorage> {
        &self.storage
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.read().len()
    }

    fn remote_list(&self) -> Vec<Arc<dyn RemoteFolder>> {
        self.remotes.read().values().cloned().collect()
    }

    async fn run_blocking<T, F>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce() -> VaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| VaultError::Other(anyhow::anyhow!("worker pool closed: {e}")))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| VaultError::Other(anyhow::anyhow!("blocking task failed: {e}")))?
    }

    // ── Local scan ──────────────────────────────────────────────────────────

    /// Index every entry of the tree and every known entry that vanished.
    ///
    /// Returns the number of entries with a new revision. Folders whose
    /// secret cannot sign are never scanned.
    pub async fn scan(self: &Arc<Self>) -> VaultResult<usize> {
        let this = self.clone();
        self.run_blocking(move || this.scan_blocking()).await
    }

    fn scan_blocking(&self) -> VaultResult<usize> {
        let Some(indexer) = &self.indexer else {
            return Ok(0);
        };
        let keys = self.secret.keys()?;
        let mut paths = collect_entries(&self.root, &self.system_path)?;
        let mut seen: HashSet<PathBuf> = paths.iter().cloned().collect();
        for smeta in self.index.existing_meta() {
            let Ok(normalized) = smeta.meta().decrypt_path(keys) else {
                continue;
            };
            if let Some(path) = denormalize_path(&self.root, &normalized) {
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        let mut changed = 0;
        for path in &paths {
            match self.index_path(indexer, path) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(path = %path.display(), "indexing failed");
                    warn!("indexing failed: {e}");
                }
            }
        }
        info!(entries = paths.len(), changed, "folder scanned");
        Ok(changed)
    }

    fn index_path(&self, indexer: &Indexer, path: &Path) -> VaultResult<bool> {
        let path_id = indexer.path_id_of(path)?;
        let previous = self.index.get_meta_by_path(&path_id).ok();
        let entry = indexer.index_entry(path, previous.as_ref().map(|p| p.meta().revision))?;
        if let Some(previous) = &previous {
            if same_state(previous.meta(), entry.smeta.meta()) {
                return Ok(false);
            }
        }
        self.index.put_meta(&entry.smeta, true)?;
        debug!(path = %path.display(), revision = entry.smeta.meta().revision, "local change indexed");
        Ok(true)
    }

    // ── Peers ───────────────────────────────────────────────────────────────

    pub fn attach_remote(&self, remote: Arc<dyn RemoteFolder>) {
        let id = remote.id();
        info!(remote = %id, endpoint = %remote.endpoint(), "remote attached");
        self.remotes.write().insert(id, remote.clone());
        self.downloader.track_remote(remote.clone());
        self.meta_uploader.handle_attached(&*remote);
    }

    /// Drop a peer and everything the downloader holds for it.
    pub fn detach_remote(&self, id: RemoteId) {
        if self.remotes.write().remove(&id).is_some() {
            self.downloader.untrack_remote(id);
            info!(remote = %id, "remote detached");
        }
    }

    /// Process one message from an attached peer.
    ///
    /// Recoverable failures are logged and swallowed; a protocol violation
    /// additionally releases that peer's outstanding requests.
    pub async fn handle_message(self: &Arc<Self>, from: RemoteId, msg: PeerMessage) -> VaultResult<()> {
        match self.dispatch(from, msg).await {
            Err(VaultError::ProtocolViolation(reason)) => {
                warn!(remote = %from, "protocol violation: {reason}");
                self.downloader.handle_choke(from);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!(remote = %from, "{e}");
                Ok(())
            }
            other => other,
        }
    }

    async fn dispatch(self: &Arc<Self>, from: RemoteId, msg: PeerMessage) -> VaultResult<()> {
        let Some(remote) = self.remotes.read().get(&from).cloned() else {
            debug!(remote = %from, kind = msg.kind(), "message from detached remote dropped");
            return Ok(());
        };

        match msg {
            PeerMessage::Choke => self.downloader.handle_choke(from),
            PeerMessage::Unchoke => self.downloader.handle_unchoke(from),
            PeerMessage::Interested => self.uploader.handle_interested(&*remote),
            PeerMessage::NotInterested => self.uploader.handle_not_interested(&*remote),
            PeerMessage::HaveMeta { revision, bitfield } => {
                self.meta_downloader
                    .handle_have_meta(&*remote, &revision, &bitfield)?;
            }
            PeerMessage::HaveChunk { ct_hash } => self.downloader.notify_remote_chunk(from, &ct_hash),
            PeerMessage::MetaRequest { revision } => {
                self.meta_uploader.handle_meta_request(&*remote, &revision)
            }
            PeerMessage::MetaReply { smeta, bitfield } => {
                self.meta_downloader
                    .handle_meta_reply(from, &smeta, &bitfield)?;
            }
            PeerMessage::BlockRequest {
                ct_hash,
                offset,
                length,
            } => {
                let uploader = self.uploader.clone();
                self.run_blocking(move || {
                    uploader
                        .handle_block_request(&*remote, &ct_hash, offset, length)
                        .map(|_| ())
                })
                .await?;
            }
            PeerMessage::BlockReply {
                ct_hash,
                offset,
                data,
            } => {
                let downloader = self.downloader.clone();
                self.run_blocking(move || downloader.put_block(&ct_hash, offset, &data, from).map(|_| ()))
                    .await?;
            }
        }
        Ok(())
    }

    // ── Event pump ──────────────────────────────────────────────────────────

    async fn handle_index_event(self: &Arc<Self>, event: IndexEvent) {
        let smeta = event.smeta().clone();
        let bitfield = self.storage.make_bitfield(smeta.meta());
        if let Err(e) = self.downloader.notify_local_meta(&smeta, &bitfield) {
            warn!(rev = %smeta.path_revision(), "downloader rejected meta: {e}");
        }
        self.meta_uploader.broadcast_meta(&self.remote_list(), &smeta);
        if let IndexEvent::MetaAddedExternal(_) = event {
            self.assemble(smeta).await;
        }
    }

    async fn handle_chunk_event(self: &Arc<Self>, event: ChunkEvent) {
        let ChunkEvent::ChunkAdded(ct_hash) = event;
        self.uploader.broadcast_chunk(&self.remote_list(), &ct_hash);
        self.downloader.notify_local_chunk(&ct_hash);
        for smeta in self.index.containing_chunk(&ct_hash) {
            self.assemble(smeta).await;
        }
    }

    async fn assemble(self: &Arc<Self>, smeta: SignedMeta) {
        let Some(assembler) = self.assembler.clone() else {
            return;
        };
        let rev = smeta.path_revision();
        if let Err(e) = self.run_blocking(move || assembler.assemble(&smeta)).await {
            warn!(%rev, "assembly failed: {e}");
        }
    }

    /// Rebuild downloader state after missed events.
    async fn resync(self: &Arc<Self>) {
        for smeta in self.index.incomplete_meta() {
            let bitfield = self.storage.make_bitfield(smeta.meta());
            if let Err(e) = self.downloader.notify_local_meta(&smeta, &bitfield) {
                warn!(rev = %smeta.path_revision(), "resync failed: {e}");
            }
        }
        self.housekeeping().await;
    }

    async fn housekeeping(self: &Arc<Self>) {
        let this = self.clone();
        let result = self
            .run_blocking(move || {
                if let Some(assembler) = &this.assembler {
                    let done = assembler.assemble_pending();
                    if done > 0 {
                        debug!(done, "pending metas assembled");
                    }
                }
                this.storage.rebalance()
            })
            .await;
        if let Err(e) = result {
            warn!("housekeeping failed: {e}");
        }
    }

    /// Drive the folder until `shutdown` flips or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut index_rx = self.index.subscribe();
        let mut chunk_rx = self.storage.subscribe();
        let mut maintain = tokio::time::interval(self.maintain_interval);
        maintain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(folder_id = %self.folder_id(), "folder running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = maintain.tick() => {
                    self.downloader.maintain_requests();
                }
                _ = housekeeping.tick() => self.housekeeping().await,
                event = index_rx.recv() => match event {
                    Ok(event) => self.handle_index_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "index events lagged, resyncing");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = chunk_rx.recv() => match event {
                    Ok(event) => self.handle_chunk_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chunk events lagged, resyncing");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let ids: Vec<RemoteId> = self.remotes.read().keys().copied().collect();
        for id in ids {
            self.detach_remote(id);
        }
        info!(folder_id = %self.folder_id(), "folder stopped");
    }
}

/// Whether a fresh index of an entry describes what is already stored.
fn same_state(stored: &MetaInfo, fresh: &MetaInfo) -> bool {
    stored.kind == fresh.kind
        && stored.mode == fresh.mode
        && stored.symlink_target == fresh.symlink_target
        && (stored.kind == EntryKind::Directory || stored.mtime == fresh.mtime)
        && stored
            .chunks
            .iter()
            .map(|c| c.ct_hash)
            .eq(fresh.chunks.iter().map(|c| c.ct_hash))
}
