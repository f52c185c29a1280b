//! vs-crypto: folder capabilities and content protection for vaultsync
//!
//! Every folder is described by a [`Secret`]. Its privilege level decides
//! what a node may do with the folder's data:
//!
//! ```text
//! Owner      (A)  signing seed                  sign + decrypt, derive all
//! ReadWrite  (B)  signing seed + folder key     sign + decrypt
//! ReadOnly   (C)  public key + folder key       verify + decrypt
//! Untrusted  (D)  public key                    verify only (stores ciphertext)
//! ```
//!
//! Key hierarchy:
//! ```text
//! Folder Key (256-bit, HKDF from the Ed25519 seed)
//!   ├── chunk key    XChaCha20-Poly1305, nonce = per-chunk IV
//!   ├── iv key       keyed BLAKE3 of plaintext -> 192-bit IV (content-derived)
//!   ├── hmac key     keyed BLAKE3 of plaintext -> chunk binding
//!   ├── path key     AES-256-SIV over the normalized relative path
//!   └── path-id key  keyed BLAKE3 of the normalized path -> PathId
//! ```
//!
//! Chunks are addressed by `ct_hash = BLAKE3(ciphertext)` so nodes holding
//! only the public key can still verify what they store and relay.

pub mod chunk;
pub mod keys;
pub mod meta;
pub mod names;
pub mod secret;
pub mod signed_meta;

pub use chunk::{
    compute_ct_hash, decrypt_chunk, derive_iv, encrypt_chunk, open_chunk, seal_chunk, EncryptedChunk,
};
pub use keys::FolderKeys;
pub use meta::{ChunkInfo, EntryKind, MetaInfo, PathRevision};
pub use names::{decrypt_path, denormalize_path, encrypt_path, normalize_path, path_id};
pub use secret::{Secret, SecretError, SecretLevel};
pub use signed_meta::SignedMeta;

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a per-chunk IV, used as the XChaCha20-Poly1305 nonce (192-bit)
pub const IV_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Ciphertext length of a chunk with `plaintext_len` bytes, `None` if it
/// does not fit in a `u32`.
pub fn ciphertext_len(plaintext_len: u32) -> Option<u32> {
    plaintext_len.checked_add(TAG_SIZE as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ciphertext_len_bounds() {
        assert_eq!(ciphertext_len(0), Some(16));
        assert_eq!(ciphertext_len(2984), Some(3000));
        assert_eq!(ciphertext_len(u32::MAX - 16), Some(u32::MAX));
        assert_eq!(ciphertext_len(u32::MAX - 15), None);
        assert_eq!(ciphertext_len(u32::MAX - 4), None);
    }
}
