//! Immutable description of one filesystem entry at one revision.

use serde::{Deserialize, Serialize};
use std::fmt;
use vs_core::types::{hex_array, hex_vec};
use vs_core::{CtHash, PathId};

use crate::keys::FolderKeys;
use crate::names::decrypt_path;
use crate::IV_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deleted,
    File,
    Directory,
    Symlink,
}

/// Descriptor of one encrypted chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub ct_hash: CtHash,
    /// Plaintext length
    pub size: u32,
    #[serde(with = "hex_array")]
    pub iv: [u8; IV_SIZE],
    #[serde(with = "hex_array")]
    pub pt_hmac: [u8; 32],
}

/// (path identifier, revision) pair ordering successive states of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathRevision {
    pub path_id: PathId,
    pub revision: u64,
}

impl PathRevision {
    pub fn new(path_id: PathId, revision: u64) -> Self {
        Self { path_id, revision }
    }

    /// Whether this revision supersedes `stored` for the same path.
    pub fn dominates(&self, stored: u64) -> bool {
        self.revision > stored
    }
}

impl fmt::Display for PathRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path_id, self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub path_id: PathId,
    pub revision: u64,
    pub kind: EntryKind,
    #[serde(with = "hex_vec")]
    pub encrypted_path: Vec<u8>,
    /// Modification time, seconds since the Unix epoch
    #[serde(default)]
    pub mtime: i64,
    /// Unix permission bits
    #[serde(default)]
    pub mode: u32,
    /// Encrypted link target, symlinks only
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hex")]
    pub symlink_target: Option<Vec<u8>>,
    #[serde(default)]
    pub min_chunksize: u32,
    #[serde(default)]
    pub max_chunksize: u32,
    #[serde(default)]
    pub chunks: Vec<ChunkInfo>,
}

impl MetaInfo {
    pub fn path_revision(&self) -> PathRevision {
        PathRevision::new(self.path_id, self.revision)
    }

    /// Total plaintext size of a file entry.
    pub fn file_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }

    /// Plaintext offset of every occurrence of `ct_hash` in this meta.
    pub fn chunk_offsets(&self, ct_hash: &CtHash) -> Vec<(usize, u64)> {
        let mut offset = 0u64;
        let mut out = Vec::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.ct_hash == *ct_hash {
                out.push((i, offset));
            }
            offset += chunk.size as u64;
        }
        out
    }

    pub fn find_chunk(&self, ct_hash: &CtHash) -> Option<&ChunkInfo> {
        self.chunks.iter().find(|c| c.ct_hash == *ct_hash)
    }

    pub fn decrypt_path(&self, keys: &FolderKeys) -> anyhow::Result<String> {
        decrypt_path(keys, &self.encrypted_path)
    }

    pub fn decrypt_symlink_target(&self, keys: &FolderKeys) -> anyhow::Result<String> {
        let target = self
            .symlink_target
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("meta {} has no symlink target", self.path_revision()))?;
        decrypt_path(keys, target)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow::anyhow!("meta serialization failed: {e}"))
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow::anyhow!("meta deserialization failed: {e}"))
    }
}

mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
