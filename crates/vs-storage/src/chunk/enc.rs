//! Encrypted-at-rest chunk store.
//!
//! Ciphertext is kept exactly as transferred. Writes are atomic
//! (temp → rename) and retried a bounded number of times before the
//! I/O error is surfaced.
//!
//! Layout: `{dir}/{hex[0..2]}/chunk-{hex}` (two-level sharding).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use vs_core::{CtHash, VaultError, VaultResult};

pub struct EncStorage {
    dir: PathBuf,
    io_retries: u32,
    lock: RwLock<()>,
}

impl EncStorage {
    pub fn new(dir: PathBuf, io_retries: u32) -> VaultResult<Self> {
        fs::create_dir_all(&dir)?;
        Ok(EncStorage {
            dir,
            io_retries,
            lock: RwLock::new(()),
        })
    }

    fn path_for(&self, ct_hash: &CtHash) -> PathBuf {
        let hex = ct_hash.to_hex();
        self.dir.join(&hex[..2]).join(format!("chunk-{hex}"))
    }

    pub fn have(&self, ct_hash: &CtHash) -> bool {
        let _r = self.lock.read();
        self.path_for(ct_hash).exists()
    }

    pub fn get(&self, ct_hash: &CtHash) -> VaultResult<Arc<[u8]>> {
        let _r = self.lock.read();
        match fs::read(self.path_for(ct_hash)) {
            Ok(data) => Ok(Arc::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(VaultError::NoSuchChunk(*ct_hash)),
            Err(e) => Err(e.into()),
        }
    }

    fn with_retries(&self, what: &str, ct_hash: &CtHash, mut op: impl FnMut() -> io::Result<()>) -> VaultResult<()> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.io_retries => {
                    attempt += 1;
                    warn!(%ct_hash, attempt, "{what} failed, retrying: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Store ciphertext bytes.
    pub fn put(&self, ct_hash: &CtHash, data: &[u8]) -> VaultResult<()> {
        let _w = self.lock.write();
        let path = self.path_for(ct_hash);
        self.with_retries("chunk write", ct_hash, || write_atomic(&path, data))?;
        debug!(%ct_hash, size = data.len(), "chunk stored in encrypted storage");
        Ok(())
    }

    /// Move a fully written ciphertext file into the store.
    pub fn put_file(&self, ct_hash: &CtHash, src: &Path) -> VaultResult<()> {
        let _w = self.lock.write();
        let path = self.path_for(ct_hash);
        self.with_retries("chunk move", ct_hash, || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            match fs::rename(src, &path) {
                Ok(()) => Ok(()),
                // Different filesystem: copy then drop the source
                Err(_) => {
                    let data = fs::read(src)?;
                    write_atomic(&path, &data)?;
                    fs::remove_file(src)
                }
            }
        })?;
        debug!(%ct_hash, "chunk moved into encrypted storage");
        Ok(())
    }

    pub fn remove(&self, ct_hash: &CtHash) -> VaultResult<()> {
        let _w = self.lock.write();
        match fs::remove_file(self.path_for(ct_hash)) {
            Ok(()) => {
                debug!(%ct_hash, "chunk removed from encrypted storage");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored ct_hash.
    pub fn list(&self) -> VaultResult<Vec<CtHash>> {
        let _r = self.lock.read();
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let name = entry?.file_name();
                let parsed = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("chunk-"))
                    .and_then(|hex| hex.parse::<CtHash>().ok());
                if let Some(ct_hash) = parsed {
                    out.push(ct_hash);
                }
            }
        }
        Ok(out)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let enc = EncStorage::new(dir.path().join("chunks"), 3).unwrap();
        let h = CtHash::from_bytes([0xab; 32]);

        assert!(!enc.have(&h));
        assert!(matches!(enc.get(&h), Err(VaultError::NoSuchChunk(_))));

        enc.put(&h, b"ciphertext").unwrap();
        assert!(enc.have(&h));
        assert_eq!(&*enc.get(&h).unwrap(), b"ciphertext");
        assert!(dir
            .path()
            .join("chunks/ab")
            .join(format!("chunk-{}", h.to_hex()))
            .exists());
        assert_eq!(enc.list().unwrap(), vec![h]);

        enc.remove(&h).unwrap();
        assert!(!enc.have(&h));
        enc.remove(&h).unwrap(); // idempotent
    }

    #[test]
    fn test_put_file_moves_source() {
        let dir = tempfile::tempdir().unwrap();
        let enc = EncStorage::new(dir.path().join("chunks"), 0).unwrap();
        let src = dir.path().join("download.part");
        fs::write(&src, b"assembled").unwrap();
        let h = CtHash::from_bytes([1; 32]);

        enc.put_file(&h, &src).unwrap();
        assert!(!src.exists());
        assert_eq!(&*enc.get(&h).unwrap(), b"assembled");
    }
}
