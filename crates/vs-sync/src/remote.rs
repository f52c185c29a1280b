//! Peer handles as seen by the transfer components.
//!
//! The connection layer owns sockets, framing, and the handshake; all the
//! transfer code needs is something that can be asked about choke/interest
//! state and handed outgoing messages.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;
use vs_core::{Bitfield, CtHash};
use vs_crypto::{PathRevision, SignedMeta};

use crate::messages::PeerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId(pub u64);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote#{}", self.0)
    }
}

pub trait RemoteFolder: Send + Sync {
    fn id(&self) -> RemoteId;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;

    /// Connected and past the handshake
    fn ready(&self) -> bool;

    fn am_choking(&self) -> bool;
    fn am_interested(&self) -> bool;
    fn peer_choking(&self) -> bool;
    fn peer_interested(&self) -> bool;

    fn send(&self, msg: PeerMessage);

    fn send_choke(&self) {
        self.send(PeerMessage::Choke);
    }

    fn send_unchoke(&self) {
        self.send(PeerMessage::Unchoke);
    }

    fn send_interested(&self) {
        self.send(PeerMessage::Interested);
    }

    fn send_not_interested(&self) {
        self.send(PeerMessage::NotInterested);
    }

    fn send_have_meta(&self, revision: PathRevision, bitfield: Bitfield) {
        self.send(PeerMessage::HaveMeta { revision, bitfield });
    }

    fn send_have_chunk(&self, ct_hash: CtHash) {
        self.send(PeerMessage::HaveChunk { ct_hash });
    }

    fn send_meta_request(&self, revision: PathRevision) {
        self.send(PeerMessage::MetaRequest { revision });
    }

    fn send_meta(&self, smeta: SignedMeta, bitfield: Bitfield) {
        self.send(PeerMessage::MetaReply { smeta, bitfield });
    }

    fn send_block_request(&self, ct_hash: CtHash, offset: u32, length: u32) {
        self.send(PeerMessage::BlockRequest {
            ct_hash,
            offset,
            length,
        });
    }

    fn send_block(&self, ct_hash: CtHash, offset: u32, data: Vec<u8>) {
        self.send(PeerMessage::BlockReply {
            ct_hash,
            offset,
            data,
        });
    }
}

/// A remote whose outgoing messages go into an mpsc channel.
///
/// Choke/interest flags follow the messages sent (`am_*`) and the messages
/// passed to [`ChannelRemote::observe`] (`peer_*`). Both sides start choked
/// and not interested.
pub struct ChannelRemote {
    id: RemoteId,
    endpoint: String,
    tx: mpsc::UnboundedSender<PeerMessage>,
    ready: AtomicBool,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    peer_choking: AtomicBool,
    peer_interested: AtomicBool,
}

impl ChannelRemote {
    pub fn new(
        id: RemoteId,
        endpoint: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Arc::new(ChannelRemote {
            id,
            endpoint: endpoint.into(),
            tx,
            ready: AtomicBool::new(true),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
        });
        (remote, rx)
    }

    /// Record the effect of a message received from the peer.
    pub fn observe(&self, msg: &PeerMessage) {
        match msg {
            PeerMessage::Choke => self.peer_choking.store(true, Ordering::SeqCst),
            PeerMessage::Unchoke => self.peer_choking.store(false, Ordering::SeqCst),
            PeerMessage::Interested => self.peer_interested.store(true, Ordering::SeqCst),
            PeerMessage::NotInterested => self.peer_interested.store(false, Ordering::SeqCst),
            _ => {}
        }
    }

    pub fn disconnect(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }
}

impl RemoteFolder for ChannelRemote {
    fn id(&self) -> RemoteId {
        self.id
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::SeqCst)
    }

    fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::SeqCst)
    }

    fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::SeqCst)
    }

    fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::SeqCst)
    }

    fn send(&self, msg: PeerMessage) {
        match &msg {
            PeerMessage::Choke => self.am_choking.store(true, Ordering::SeqCst),
            PeerMessage::Unchoke => self.am_choking.store(false, Ordering::SeqCst),
            PeerMessage::Interested => self.am_interested.store(true, Ordering::SeqCst),
            PeerMessage::NotInterested => self.am_interested.store(false, Ordering::SeqCst),
            _ => {}
        }
        trace!(remote = %self.id, kind = msg.kind(), "send");
        // A closed channel means the peer is gone; ready() reports it
        let _ = self.tx.send(msg);
    }
}

/// Keeps us "interested" in a remote while at least one clone is alive.
///
/// Creating the first guard sends `Interested`; dropping the last one
/// sends `NotInterested` unless the remote already went away.
pub struct InterestGuard {
    remote: Arc<dyn RemoteFolder>,
}

impl InterestGuard {
    pub fn new(remote: Arc<dyn RemoteFolder>) -> Arc<Self> {
        remote.send_interested();
        Arc::new(InterestGuard { remote })
    }

    pub fn remote_id(&self) -> RemoteId {
        self.remote.id()
    }
}

impl Drop for InterestGuard {
    fn drop(&mut self) {
        if self.remote.ready() {
            self.remote.send_not_interested();
        }
    }
}

impl fmt::Debug for InterestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterestGuard")
            .field("remote", &self.remote.id())
            .finish()
    }
}
