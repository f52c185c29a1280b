//! Chunks served straight from the plaintext folder tree.
//!
//! Nothing is stored here: a chunk is reconstructed by reading its
//! plaintext range out of an assembled file and re-encrypting it with the
//! recorded IV. The result is only returned if its hash matches, so a file
//! edited behind our back is simply a miss.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{trace, warn};
use vs_core::{CtHash, VaultError, VaultResult};
use vs_crypto::{compute_ct_hash, denormalize_path, encrypt_chunk, FolderKeys, Secret, IV_SIZE};

use crate::index::Index;

pub struct OpenStorage {
    root: PathBuf,
    secret: Secret,
    index: Arc<Index>,
}

impl OpenStorage {
    pub fn new(root: PathBuf, secret: Secret, index: Arc<Index>) -> Self {
        OpenStorage { root, secret, index }
    }

    pub fn have(&self, ct_hash: &CtHash) -> bool {
        self.index.is_chunk_assembled(ct_hash)
    }

    pub fn get(&self, ct_hash: &CtHash) -> VaultResult<Arc<[u8]>> {
        let keys = self.secret.keys()?;
        let (size, iv) = self.index.chunk_size_iv(ct_hash)?;

        for smeta in self.index.containing_chunk(ct_hash) {
            let meta = smeta.meta();
            let Ok(normalized) = meta.decrypt_path(keys) else {
                continue;
            };
            let Some(path) = denormalize_path(&self.root, &normalized) else {
                continue;
            };
            for (_, offset) in meta.chunk_offsets(ct_hash) {
                match self.try_read(keys, &path, offset, size, &iv, ct_hash) {
                    Ok(Some(ct)) => {
                        trace!(%ct_hash, path = %normalized, offset, "chunk served from open storage");
                        return Ok(ct);
                    }
                    Ok(None) => {
                        warn!(%ct_hash, offset, "plaintext no longer matches chunk hash");
                    }
                    Err(e) => {
                        trace!(%ct_hash, path = %normalized, "open storage read failed: {e:#}");
                    }
                }
            }
        }
        Err(VaultError::NoSuchChunk(*ct_hash))
    }

    fn try_read(
        &self,
        keys: &FolderKeys,
        path: &Path,
        offset: u64,
        size: u32,
        iv: &[u8; IV_SIZE],
        ct_hash: &CtHash,
    ) -> anyhow::Result<Option<Arc<[u8]>>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut pt = vec![0u8; size as usize];
        file.read_exact(&mut pt)?;
        let ct = encrypt_chunk(keys, iv, &pt)?;
        if compute_ct_hash(&ct) != *ct_hash {
            return Ok(None);
        }
        Ok(Some(Arc::from(ct)))
    }
}
