//! Peer protocol messages.
//!
//! These are the abstract messages the transfer components consume and
//! produce. Framing and encryption of the transport are the connection
//! layer's business; `to_bytes`/`from_bytes` give a JSON encoding for
//! transports that just need bytes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use vs_core::types::hex_vec;
use vs_core::{Bitfield, CtHash};
use vs_crypto::{PathRevision, SignedMeta};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// We will not serve block requests
    Choke,
    Unchoke,
    /// We want data the peer has
    Interested,
    NotInterested,
    /// We hold this meta revision; `bitfield` marks the chunks we can serve
    HaveMeta {
        revision: PathRevision,
        bitfield: Bitfield,
    },
    /// A new chunk became available
    HaveChunk { ct_hash: CtHash },
    MetaRequest { revision: PathRevision },
    MetaReply { smeta: SignedMeta, bitfield: Bitfield },
    BlockRequest {
        ct_hash: CtHash,
        offset: u32,
        length: u32,
    },
    BlockReply {
        ct_hash: CtHash,
        offset: u32,
        #[serde(with = "hex_vec")]
        data: Vec<u8>,
    },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not_interested",
            PeerMessage::HaveMeta { .. } => "have_meta",
            PeerMessage::HaveChunk { .. } => "have_chunk",
            PeerMessage::MetaRequest { .. } => "meta_request",
            PeerMessage::MetaReply { .. } => "meta_reply",
            PeerMessage::BlockRequest { .. } => "block_request",
            PeerMessage::BlockReply { .. } => "block_reply",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
