//! Per-chunk XChaCha20-Poly1305 encryption with content-derived IVs
//!
//! Encrypted chunk format (binary):
//! ```text
//! [N bytes: ciphertext][16 bytes: Poly1305 tag]
//! nonce = iv = BLAKE3-keyed(iv_key, plaintext)[..24]   (stored in ChunkInfo)
//! ```
//!
//! Deriving the IV from the plaintext makes encryption deterministic per
//! folder key, so identical chunks in different files, or produced by
//! different peers, land on the same `ct_hash` and are stored once.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use vs_core::CtHash;

use crate::keys::FolderKeys;
use crate::meta::ChunkInfo;
use crate::{IV_SIZE, TAG_SIZE};

/// A freshly encrypted chunk with its descriptor.
#[derive(Debug, Clone)]
pub struct EncryptedChunk {
    pub info: ChunkInfo,
    pub ciphertext: Vec<u8>,
}

/// Content-derived IV for `plaintext`.
pub fn derive_iv(keys: &FolderKeys, plaintext: &[u8]) -> [u8; IV_SIZE] {
    let hash = blake3::keyed_hash(keys.iv_key(), plaintext);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&hash.as_bytes()[..IV_SIZE]);
    iv
}

/// Keyed binding of the plaintext, checked after decryption.
pub fn pt_hmac(keys: &FolderKeys, plaintext: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(keys.hmac_key(), plaintext).as_bytes()
}

/// Content address of a ciphertext.
pub fn compute_ct_hash(ciphertext: &[u8]) -> CtHash {
    CtHash::from_bytes(*blake3::hash(ciphertext).as_bytes())
}

/// Encrypt `plaintext` under the folder chunk key with the given IV.
///
/// Returns `[ciphertext][16-byte tag]`.
pub fn encrypt_chunk(
    keys: &FolderKeys,
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(keys.chunk_key().into());
    cipher
        .encrypt(XNonce::from_slice(iv), plaintext)
        .map_err(|e| anyhow::anyhow!("chunk encryption failed: {e}"))
}

/// Decrypt a chunk produced by [`encrypt_chunk`].
pub fn decrypt_chunk(
    keys: &FolderKeys,
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
) -> anyhow::Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        anyhow::bail!(
            "encrypted chunk too short: {} bytes (minimum {})",
            ciphertext.len(),
            TAG_SIZE
        );
    }
    let cipher = XChaCha20Poly1305::new(keys.chunk_key().into());
    cipher
        .decrypt(XNonce::from_slice(iv), ciphertext)
        .map_err(|_| anyhow::anyhow!("chunk decryption failed: invalid key or corrupted data"))
}

/// Derive the IV, encrypt, and describe one plaintext chunk.
pub fn seal_chunk(keys: &FolderKeys, plaintext: &[u8]) -> anyhow::Result<EncryptedChunk> {
    let iv = derive_iv(keys, plaintext);
    let ciphertext = encrypt_chunk(keys, &iv, plaintext)?;
    let size = u32::try_from(plaintext.len())
        .map_err(|_| anyhow::anyhow!("chunk too large: {} bytes", plaintext.len()))?;
    Ok(EncryptedChunk {
        info: ChunkInfo {
            ct_hash: compute_ct_hash(&ciphertext),
            size,
            iv,
            pt_hmac: pt_hmac(keys, plaintext),
        },
        ciphertext,
    })
}

/// Decrypt a stored chunk and check it against its descriptor.
pub fn open_chunk(keys: &FolderKeys, info: &ChunkInfo, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
    if compute_ct_hash(ciphertext) != info.ct_hash {
        anyhow::bail!("ciphertext does not match ct_hash {}", info.ct_hash);
    }
    let plaintext = decrypt_chunk(keys, &info.iv, ciphertext)?;
    if pt_hmac(keys, &plaintext) != info.pt_hmac {
        anyhow::bail!("plaintext binding mismatch for {}", info.ct_hash);
    }
    Ok(plaintext)
}
