//! Meta announcement and retrieval between peers.

use std::sync::Arc;

use tracing::debug;
use vs_core::VaultResult;
use vs_crypto::{PathRevision, SignedMeta};
use vs_storage::{ChunkStorage, Index, PutMetaOutcome};

use crate::downloader::Downloader;
use crate::remote::{RemoteFolder, RemoteId};

/// Announces what we hold and answers meta requests.
pub struct MetaUploader {
    index: Arc<Index>,
    storage: Arc<ChunkStorage>,
}

impl MetaUploader {
    pub fn new(index: Arc<Index>, storage: Arc<ChunkStorage>) -> Self {
        MetaUploader { index, storage }
    }

    /// Handshake: announce every stored meta to a freshly attached peer.
    pub fn handle_attached(&self, remote: &dyn RemoteFolder) {
        let metas = self.index.all_meta();
        debug!(remote = %remote.id(), count = metas.len(), "announcing metas");
        for smeta in metas {
            let bitfield = self.storage.make_bitfield(smeta.meta());
            remote.send_have_meta(smeta.path_revision(), bitfield);
        }
    }

    pub fn broadcast_meta(&self, remotes: &[Arc<dyn RemoteFolder>], smeta: &SignedMeta) {
        let bitfield = self.storage.make_bitfield(smeta.meta());
        for remote in remotes.iter().filter(|r| r.ready()) {
            remote.send_have_meta(smeta.path_revision(), bitfield.clone());
        }
    }

    pub fn handle_meta_request(&self, remote: &dyn RemoteFolder, revision: &PathRevision) {
        match self.index.get_meta(revision) {
            Ok(smeta) => {
                let bitfield = self.storage.make_bitfield(smeta.meta());
                remote.send_meta(smeta, bitfield);
            }
            Err(e) => debug!(remote = %remote.id(), %revision, "meta request not served: {e}"),
        }
    }
}

/// Turns peer announcements into meta requests and downloader input.
pub struct MetaDownloader {
    index: Arc<Index>,
    storage: Arc<ChunkStorage>,
    downloader: Arc<Downloader>,
}

impl MetaDownloader {
    pub fn new(index: Arc<Index>, storage: Arc<ChunkStorage>, downloader: Arc<Downloader>) -> Self {
        MetaDownloader {
            index,
            storage,
            downloader,
        }
    }

    pub fn handle_have_meta(
        &self,
        remote: &dyn RemoteFolder,
        revision: &PathRevision,
        bitfield: &[bool],
    ) -> VaultResult<()> {
        if self.index.have_meta(revision) {
            self.downloader
                .notify_remote_meta(remote.id(), revision, bitfield)
        } else if self.index.put_allowed(revision) {
            remote.send_meta_request(*revision);
            Ok(())
        } else {
            debug!(remote = %remote.id(), %revision, "peer announced an outdated meta");
            Ok(())
        }
    }

    /// Store a meta a peer sent us and record which chunks it can serve.
    pub fn handle_meta_reply(
        &self,
        remote: RemoteId,
        smeta: &SignedMeta,
        bitfield: &[bool],
    ) -> VaultResult<()> {
        let revision = smeta.path_revision();
        if self.index.put_meta(smeta, false)? == PutMetaOutcome::Stale {
            debug!(%remote, %revision, "peer sent an outdated meta");
            return Ok(());
        }
        // Chunk records must exist before ownership can be attached to them
        let local = self.storage.make_bitfield(smeta.meta());
        self.downloader.notify_local_meta(smeta, &local)?;
        self.downloader.notify_remote_meta(remote, &revision, bitfield)
    }
}
