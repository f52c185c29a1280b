use thiserror::Error;

use crate::types::{CtHash, PathId};

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("meta not found: {0}")]
    MetaNotFound(PathId),

    #[error("no such chunk: {0}")]
    NoSuchChunk(CtHash),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("stale revision for {path_id}: {revision}")]
    StaleRevision { path_id: PathId, revision: u64 },

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("insufficient privileges: {0}")]
    Privileges(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Errors that are handled by refetching or rescheduling rather than
    /// surfacing to the operator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::MetaNotFound(_)
                | VaultError::NoSuchChunk(_)
                | VaultError::Verification(_)
                | VaultError::StaleRevision { .. }
                | VaultError::ProtocolViolation(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::MetaNotFound(_) | VaultError::NoSuchChunk(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(VaultError::NoSuchChunk(CtHash::from_bytes([1; 32])).is_recoverable());
        assert!(VaultError::Verification("bad hash".into()).is_recoverable());
        assert!(VaultError::ProtocolViolation("offset".into()).is_recoverable());
        assert!(!VaultError::Index("commit failed".into()).is_recoverable());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(!VaultError::from(io).is_recoverable());
    }

    #[test]
    fn test_not_found() {
        assert!(VaultError::MetaNotFound(PathId::from_bytes([0; 32])).is_not_found());
        assert!(!VaultError::Config("x".into()).is_not_found());
    }
}
