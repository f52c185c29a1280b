//! Folder capability token.
//!
//! Text form: `<type><version><base58 payload><check>`, where the check
//! character is Luhn mod N over the base58 alphabet so typos are caught
//! before any key material is parsed.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use vs_core::VaultError;
use zeroize::Zeroizing;

use crate::keys::{hkdf_derive, FolderKeys};
use crate::KEY_SIZE;

const VERSION: char = '1';
const ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("secret string is malformed")]
    Malformed,
    #[error("unsupported secret version {0:?}")]
    Version(char),
    #[error("unknown secret type {0:?}")]
    UnknownType(char),
    #[error("secret checksum mismatch")]
    Checksum,
    #[error("secret payload is not valid base58")]
    Base58,
    #[error("secret key material is invalid")]
    KeyMaterial,
    #[error("secret level {have:?} cannot {action}")]
    InsufficientPrivileges {
        have: SecretLevel,
        action: &'static str,
    },
    #[error("signature has invalid length")]
    SignatureFormat,
}

impl From<SecretError> for VaultError {
    fn from(e: SecretError) -> Self {
        match e {
            SecretError::InsufficientPrivileges { .. } => VaultError::Privileges(e.to_string()),
            other => VaultError::Crypto(other.to_string()),
        }
    }
}

/// Capability levels, most privileged first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecretLevel {
    Owner,
    ReadWrite,
    ReadOnly,
    Untrusted,
}

impl SecretLevel {
    pub fn type_char(self) -> char {
        match self {
            SecretLevel::Owner => 'A',
            SecretLevel::ReadWrite => 'B',
            SecretLevel::ReadOnly => 'C',
            SecretLevel::Untrusted => 'D',
        }
    }

    pub fn from_type_char(c: char) -> Result<Self, SecretError> {
        match c {
            'A' => Ok(SecretLevel::Owner),
            'B' => Ok(SecretLevel::ReadWrite),
            'C' => Ok(SecretLevel::ReadOnly),
            'D' => Ok(SecretLevel::Untrusted),
            other => Err(SecretError::UnknownType(other)),
        }
    }

    pub fn can_sign(self) -> bool {
        self <= SecretLevel::ReadWrite
    }

    pub fn can_decrypt(self) -> bool {
        self <= SecretLevel::ReadOnly
    }
}

impl FromStr for SecretLevel {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(SecretLevel::Owner),
            "read-write" => Ok(SecretLevel::ReadWrite),
            "read-only" => Ok(SecretLevel::ReadOnly),
            "untrusted" | "download" => Ok(SecretLevel::Untrusted),
            _ => Err(SecretError::Malformed),
        }
    }
}

/// A folder secret at some capability level. Immutable once constructed.
#[derive(Clone)]
pub struct Secret {
    level: SecretLevel,
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
    keys: Option<FolderKeys>,
}

impl Secret {
    /// Create a fresh Owner secret for a new folder.
    pub fn generate() -> Result<Self, SecretError> {
        let signing = SigningKey::generate(&mut OsRng);
        Self::owner_from_seed(signing.to_bytes())
    }

    /// Build an Owner secret from a raw Ed25519 seed.
    pub fn owner_from_seed(seed: [u8; KEY_SIZE]) -> Result<Self, SecretError> {
        let seed = Zeroizing::new(seed);
        let signing = SigningKey::from_bytes(&seed);
        let root: [u8; KEY_SIZE] = hkdf_derive(seed.as_slice(), b"vaultsync-folder-key")
            .map_err(|_| SecretError::KeyMaterial)?;
        let keys = FolderKeys::from_root(root).map_err(|_| SecretError::KeyMaterial)?;
        Ok(Self {
            level: SecretLevel::Owner,
            verifying: signing.verifying_key(),
            signing: Some(signing),
            keys: Some(keys),
        })
    }

    pub fn level(&self) -> SecretLevel {
        self.level
    }

    pub fn can_sign(&self) -> bool {
        self.signing.is_some()
    }

    pub fn can_decrypt(&self) -> bool {
        self.keys.is_some()
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// Encryption subkeys; unavailable to Untrusted secrets.
    pub fn keys(&self) -> Result<&FolderKeys, SecretError> {
        self.keys
            .as_ref()
            .ok_or(SecretError::InsufficientPrivileges {
                have: self.level,
                action: "decrypt",
            })
    }

    /// Produce an equal or lower capability secret for the same folder.
    pub fn derive(&self, level: SecretLevel) -> Result<Self, SecretError> {
        if level < self.level {
            return Err(SecretError::InsufficientPrivileges {
                have: self.level,
                action: "derive a higher level",
            });
        }
        Ok(Self {
            level,
            signing: if level.can_sign() { self.signing.clone() } else { None },
            verifying: self.verifying,
            keys: if level.can_decrypt() { self.keys.clone() } else { None },
        })
    }

    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], SecretError> {
        let signing = self
            .signing
            .as_ref()
            .ok_or(SecretError::InsufficientPrivileges {
                have: self.level,
                action: "sign",
            })?;
        Ok(signing.sign(message).to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying.verify(message, &sig).is_ok()
    }

    /// Folder identity shared by all capability levels.
    pub fn folder_id(&self) -> [u8; 32] {
        *blake3::hash(self.verifying.as_bytes()).as_bytes()
    }

    pub fn folder_id_hex(&self) -> String {
        hex::encode(self.folder_id())
    }

    fn payload(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(2 * KEY_SIZE));
        match self.level {
            SecretLevel::Owner => {
                if let Some(s) = &self.signing {
                    out.extend_from_slice(&s.to_bytes());
                }
            }
            SecretLevel::ReadWrite => {
                if let (Some(s), Some(k)) = (&self.signing, &self.keys) {
                    out.extend_from_slice(&s.to_bytes());
                    out.extend_from_slice(k.root());
                }
            }
            SecretLevel::ReadOnly => {
                out.extend_from_slice(self.verifying.as_bytes());
                if let Some(k) = &self.keys {
                    out.extend_from_slice(k.root());
                }
            }
            SecretLevel::Untrusted => out.extend_from_slice(self.verifying.as_bytes()),
        }
        out
    }

    fn from_payload(level: SecretLevel, payload: &[u8]) -> Result<Self, SecretError> {
        let split = |p: &[u8]| -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE]), SecretError> {
            if p.len() != 2 * KEY_SIZE {
                return Err(SecretError::KeyMaterial);
            }
            let mut a = [0u8; KEY_SIZE];
            let mut b = [0u8; KEY_SIZE];
            a.copy_from_slice(&p[..KEY_SIZE]);
            b.copy_from_slice(&p[KEY_SIZE..]);
            Ok((a, b))
        };
        let key32 = |p: &[u8]| -> Result<[u8; KEY_SIZE], SecretError> {
            <[u8; KEY_SIZE]>::try_from(p).map_err(|_| SecretError::KeyMaterial)
        };
        let verifying_key =
            |b: &[u8; KEY_SIZE]| VerifyingKey::from_bytes(b).map_err(|_| SecretError::KeyMaterial);
        let folder_keys = |root| FolderKeys::from_root(root).map_err(|_| SecretError::KeyMaterial);

        match level {
            SecretLevel::Owner => Self::owner_from_seed(key32(payload)?),
            SecretLevel::ReadWrite => {
                let (seed, root) = split(payload)?;
                let signing = SigningKey::from_bytes(&seed);
                Ok(Self {
                    level,
                    verifying: signing.verifying_key(),
                    signing: Some(signing),
                    keys: Some(folder_keys(root)?),
                })
            }
            SecretLevel::ReadOnly => {
                let (public, root) = split(payload)?;
                Ok(Self {
                    level,
                    signing: None,
                    verifying: verifying_key(&public)?,
                    keys: Some(folder_keys(root)?),
                })
            }
            SecretLevel::Untrusted => Ok(Self {
                level,
                signing: None,
                verifying: verifying_key(&key32(payload)?)?,
                keys: None,
            }),
        }
    }
}

/// Luhn mod N check character over `ALPHABET`.
fn luhn_check_char(input: &str) -> Option<char> {
    let n = ALPHABET.len() as u32;
    let mut factor = 2;
    let mut sum = 0u32;
    for c in input.chars().rev() {
        let code = ALPHABET.find(c)? as u32;
        let mut addend = factor * code;
        factor = if factor == 2 { 1 } else { 2 };
        addend = addend / n + addend % n;
        sum += addend;
    }
    let check = (n - sum % n) % n;
    ALPHABET.chars().nth(check as usize)
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = Zeroizing::new(bs58::encode(self.payload().as_slice()).into_string());
        let check = luhn_check_char(&encoded).ok_or(fmt::Error)?;
        write!(f, "{}{}{}{}", self.level.type_char(), VERSION, encoded.as_str(), check)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("level", &self.level)
            .field("folder_id", &self.folder_id_hex())
            .finish_non_exhaustive()
    }
}

impl FromStr for Secret {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let type_char = chars.next().ok_or(SecretError::Malformed)?;
        let version = chars.next().ok_or(SecretError::Malformed)?;
        let check = chars.next_back().ok_or(SecretError::Malformed)?;
        let encoded = chars.as_str();
        if encoded.is_empty() {
            return Err(SecretError::Malformed);
        }

        let level = SecretLevel::from_type_char(type_char)?;
        if version != VERSION {
            return Err(SecretError::Version(version));
        }
        if luhn_check_char(encoded) != Some(check) {
            return Err(SecretError::Checksum);
        }
        let payload = Zeroizing::new(
            bs58::decode(encoded)
                .into_vec()
                .map_err(|_| SecretError::Base58)?,
        );
        Self::from_payload(level, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip_all_levels() {
        let owner = Secret::generate().unwrap();
        for level in [
            SecretLevel::Owner,
            SecretLevel::ReadWrite,
            SecretLevel::ReadOnly,
            SecretLevel::Untrusted,
        ] {
            let derived = owner.derive(level).unwrap();
            let text = derived.to_string();
            assert!(text.starts_with(level.type_char()));
            let parsed: Secret = text.parse().unwrap();
            assert_eq!(parsed.level(), level);
            assert_eq!(parsed.folder_id(), owner.folder_id());
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn test_capabilities_per_level() {
        let owner = Secret::generate().unwrap();
        let rw = owner.derive(SecretLevel::ReadWrite).unwrap();
        let ro = owner.derive(SecretLevel::ReadOnly).unwrap();
        let dl = owner.derive(SecretLevel::Untrusted).unwrap();

        assert!(owner.can_sign() && owner.can_decrypt());
        assert!(rw.can_sign() && rw.can_decrypt());
        assert!(!ro.can_sign() && ro.can_decrypt());
        assert!(!dl.can_sign() && !dl.can_decrypt());

        assert_eq!(
            owner.keys().unwrap().chunk_key(),
            ro.keys().unwrap().chunk_key()
        );
        assert!(matches!(
            dl.keys(),
            Err(SecretError::InsufficientPrivileges { .. })
        ));
    }

    #[test]
    fn test_derive_upward_fails() {
        let ro = Secret::generate().unwrap().derive(SecretLevel::ReadOnly).unwrap();
        assert!(matches!(
            ro.derive(SecretLevel::Owner),
            Err(SecretError::InsufficientPrivileges { .. })
        ));
        assert!(ro.derive(SecretLevel::Untrusted).is_ok());
    }

    #[test]
    fn test_sign_and_verify_across_levels() {
        let owner = Secret::generate().unwrap();
        let sig = owner.sign(b"payload").unwrap();
        let dl = owner.derive(SecretLevel::Untrusted).unwrap();

        assert!(dl.verify(b"payload", &sig));
        assert!(!dl.verify(b"payload!", &sig));
        assert!(!dl.verify(b"payload", &sig[..63]));
        assert!(dl.sign(b"payload").is_err());
    }

    #[test]
    fn test_checksum_catches_typo() {
        let text = Secret::generate().unwrap().to_string();
        let mut chars: Vec<char> = text.chars().collect();
        let i = 5;
        chars[i] = if chars[i] == 'a' { 'b' } else { 'a' };
        let typo: String = chars.into_iter().collect();
        assert_eq!(typo.parse::<Secret>().unwrap_err(), SecretError::Checksum);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Secret>().unwrap_err(), SecretError::Malformed);
        assert_eq!("A1".parse::<Secret>().unwrap_err(), SecretError::Malformed);
        assert_eq!(
            "Z1abcd".parse::<Secret>().unwrap_err(),
            SecretError::UnknownType('Z')
        );
        assert_eq!(
            "A9abcd".parse::<Secret>().unwrap_err(),
            SecretError::Version('9')
        );
    }

    #[test]
    fn test_debug_hides_key_material() {
        let owner = Secret::generate().unwrap();
        let dbg = format!("{owner:?}");
        assert!(!dbg.contains(&owner.to_string()));
        assert!(dbg.contains(&owner.folder_id_hex()));
    }

    #[test]
    fn test_level_names() {
        assert_eq!("read-only".parse::<SecretLevel>().unwrap(), SecretLevel::ReadOnly);
        assert_eq!("download".parse::<SecretLevel>().unwrap(), SecretLevel::Untrusted);
        assert!("admin".parse::<SecretLevel>().is_err());
    }
}
