//! Path protection: AES-SIV path encryption and keyed path identifiers
//!
//! Paths are normalized to `/`-separated strings relative to the folder root
//! before either operation, so every node derives the same `PathId` for the
//! same entry regardless of platform.

use std::path::{Component, Path, PathBuf};

use aes_siv::{
    aead::{Aead, KeyInit},
    Aes256SivAead, Nonce,
};
use vs_core::PathId;

use crate::keys::FolderKeys;

/// Encrypt a normalized path using AES-256-SIV.
///
/// AES-SIV is deterministic; the same path under the same folder key always
/// produces the same ciphertext.
pub fn encrypt_path(keys: &FolderKeys, normalized: &str) -> anyhow::Result<Vec<u8>> {
    let cipher = Aes256SivAead::new(keys.path_key().into());
    cipher
        .encrypt(&Nonce::default(), normalized.as_bytes())
        .map_err(|e| anyhow::anyhow!("path encryption failed: {e}"))
}

/// Decrypt a path produced by [`encrypt_path`].
pub fn decrypt_path(keys: &FolderKeys, ciphertext: &[u8]) -> anyhow::Result<String> {
    let cipher = Aes256SivAead::new(keys.path_key().into());
    let plaintext = cipher
        .decrypt(&Nonce::default(), ciphertext)
        .map_err(|_| anyhow::anyhow!("path decryption failed: wrong key or corrupted data"))?;
    String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("decrypted path is not UTF-8: {e}"))
}

/// Stable identifier of a normalized path.
pub fn path_id(keys: &FolderKeys, normalized: &str) -> PathId {
    PathId::from_bytes(*blake3::keyed_hash(keys.path_id_key(), normalized.as_bytes()).as_bytes())
}

/// Convert `path` under `root` to its normalized `/`-separated form.
///
/// Returns `None` for paths outside `root`, the root itself, or paths that
/// are not valid UTF-8.
pub fn normalize_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Map a normalized path back under `root`.
///
/// Rejects absolute paths and parent-directory segments so a hostile meta
/// cannot escape the folder.
pub fn denormalize_path(root: &Path, normalized: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for part in normalized.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return None;
        }
        out.push(part);
    }
    Some(out)
}
