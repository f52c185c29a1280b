//! Folder key and the per-purpose subkeys derived from it

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::KEY_SIZE;

/// Subkeys for one folder. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FolderKeys {
    root: [u8; KEY_SIZE],
    chunk: [u8; KEY_SIZE],
    iv: [u8; KEY_SIZE],
    hmac: [u8; KEY_SIZE],
    path: [u8; 2 * KEY_SIZE],
    path_id: [u8; KEY_SIZE],
}

impl FolderKeys {
    /// Expand the folder key into purpose-bound subkeys.
    pub fn from_root(root: [u8; KEY_SIZE]) -> anyhow::Result<Self> {
        Ok(Self {
            chunk: hkdf_derive(&root, b"vaultsync-chunk")?,
            iv: hkdf_derive(&root, b"vaultsync-iv")?,
            hmac: hkdf_derive(&root, b"vaultsync-hmac")?,
            path: hkdf_derive(&root, b"vaultsync-path-siv")?,
            path_id: hkdf_derive(&root, b"vaultsync-path-id")?,
            root,
        })
    }

    pub fn root(&self) -> &[u8; KEY_SIZE] {
        &self.root
    }

    pub fn chunk_key(&self) -> &[u8; KEY_SIZE] {
        &self.chunk
    }

    pub fn iv_key(&self) -> &[u8; KEY_SIZE] {
        &self.iv
    }

    pub fn hmac_key(&self) -> &[u8; KEY_SIZE] {
        &self.hmac
    }

    /// AES-256-SIV takes two 256-bit halves.
    pub fn path_key(&self) -> &[u8; 2 * KEY_SIZE] {
        &self.path
    }

    pub fn path_id_key(&self) -> &[u8; KEY_SIZE] {
        &self.path_id
    }
}

impl std::fmt::Debug for FolderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderKeys")
            .field("root", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive<const N: usize>(ikm: &[u8], info: &[u8]) -> anyhow::Result<[u8; N]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; N];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subkeys_are_distinct() {
        let keys = FolderKeys::from_root([42u8; KEY_SIZE]).unwrap();
        let all = [
            keys.chunk_key(),
            keys.iv_key(),
            keys.hmac_key(),
            keys.path_id_key(),
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
            assert_ne!(*a, keys.root());
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = FolderKeys::from_root([7u8; KEY_SIZE]).unwrap();
        let b = FolderKeys::from_root([7u8; KEY_SIZE]).unwrap();
        assert_eq!(a.chunk_key(), b.chunk_key());
        assert_eq!(a.path_key(), b.path_key());
    }

    #[test]
    fn test_debug_redacts() {
        let keys = FolderKeys::from_root([1u8; KEY_SIZE]).unwrap();
        let dbg = format!("{keys:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("[1, 1"));
    }
}
