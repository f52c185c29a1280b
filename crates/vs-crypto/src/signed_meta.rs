//! `MetaInfo` together with its exact serialized bytes and signature.
//!
//! The signature covers `raw`, not a re-serialization of `meta`, so a meta
//! received from a peer is verified against the bytes that peer signed.

use serde::{Deserialize, Serialize};
use vs_core::types::{hex_array, hex_vec};

use crate::meta::{MetaInfo, PathRevision};
use crate::secret::{Secret, SecretError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SignedMetaRepr", into = "SignedMetaRepr")]
pub struct SignedMeta {
    meta: MetaInfo,
    raw: Vec<u8>,
    signature: [u8; 64],
}

#[derive(Serialize, Deserialize)]
struct SignedMetaRepr {
    #[serde(with = "hex_vec")]
    raw: Vec<u8>,
    #[serde(with = "hex_array")]
    signature: [u8; 64],
}

impl SignedMeta {
    /// Serialize and sign `meta` with a signing-capable secret.
    pub fn sign(meta: MetaInfo, secret: &Secret) -> anyhow::Result<Self> {
        let raw = meta.to_bytes()?;
        let signature = secret.sign(&raw)?;
        Ok(Self {
            meta,
            raw,
            signature,
        })
    }

    /// Rebuild from wire/storage parts. Does not check the signature.
    pub fn from_parts(raw: Vec<u8>, signature: &[u8]) -> anyhow::Result<Self> {
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| anyhow::Error::new(SecretError::SignatureFormat))?;
        let meta = MetaInfo::from_bytes(&raw)?;
        Ok(Self {
            meta,
            raw,
            signature,
        })
    }

    /// True when the signature verifies under the folder's public key.
    pub fn is_valid(&self, secret: &Secret) -> bool {
        secret.verify(&self.raw, &self.signature)
    }

    pub fn meta(&self) -> &MetaInfo {
        &self.meta
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    pub fn path_revision(&self) -> PathRevision {
        self.meta.path_revision()
    }
}

impl TryFrom<SignedMetaRepr> for SignedMeta {
    type Error = anyhow::Error;

    fn try_from(repr: SignedMetaRepr) -> Result<Self, Self::Error> {
        SignedMeta::from_parts(repr.raw, &repr.signature)
    }
}

impl From<SignedMeta> for SignedMetaRepr {
    fn from(smeta: SignedMeta) -> Self {
        SignedMetaRepr {
            raw: smeta.raw,
            signature: smeta.signature,
        }
    }
}
