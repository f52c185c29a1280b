//! Materializes accepted metas into the plaintext folder.
//!
//! Files are rebuilt from decrypted chunks into a `.part` file under the
//! system directory and renamed into place, so a reader never sees a
//! half-written file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tracing::{debug, info, warn};
use vs_core::{VaultError, VaultResult};
use vs_crypto::{denormalize_path, open_chunk, EntryKind, FolderKeys, MetaInfo, Secret, SignedMeta};

use crate::chunk::ChunkStorage;
use crate::index::Index;

pub struct FileAssembler {
    root: PathBuf,
    tmp_dir: PathBuf,
    secret: Secret,
    index: Arc<Index>,
    storage: Arc<ChunkStorage>,
}

fn crypto_err(e: anyhow::Error) -> VaultError {
    VaultError::Crypto(format!("{e:#}"))
}

impl FileAssembler {
    pub fn new(
        root: &Path,
        system_path: &Path,
        secret: &Secret,
        index: Arc<Index>,
        storage: Arc<ChunkStorage>,
    ) -> VaultResult<Self> {
        if !secret.can_decrypt() {
            return Err(VaultError::Privileges(format!(
                "secret level {:?} cannot assemble plaintext",
                secret.level()
            )));
        }
        let tmp_dir = system_path.join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        Ok(FileAssembler {
            root: root.to_path_buf(),
            tmp_dir,
            secret: secret.clone(),
            index,
            storage,
        })
    }

    /// Bring the plaintext tree in line with `smeta`.
    ///
    /// Returns `Ok(false)` when the meta was superseded or some chunk is
    /// still missing; the caller retries once more chunks arrive.
    pub fn assemble(&self, smeta: &SignedMeta) -> VaultResult<bool> {
        let meta = smeta.meta();
        let current = self.index.get_meta_by_path(&meta.path_id)?;
        if current.meta().revision != meta.revision {
            debug!(rev = %smeta.path_revision(), "meta superseded, not assembling");
            return Ok(false);
        }

        let keys = self.secret.keys()?;
        let normalized = meta.decrypt_path(keys).map_err(crypto_err)?;
        let path = denormalize_path(&self.root, &normalized).ok_or_else(|| {
            VaultError::ProtocolViolation(format!("unsafe path in meta {}", smeta.path_revision()))
        })?;

        match meta.kind {
            EntryKind::File => {
                if !meta.chunks.iter().all(|c| self.storage.have(&c.ct_hash)) {
                    return Ok(false);
                }
                self.assemble_file(keys, meta, &path)?;
            }
            EntryKind::Directory => {
                if path.is_file() || path.is_symlink() {
                    fs::remove_file(&path)?;
                }
                fs::create_dir_all(&path)?;
                set_mode(&path, meta.mode)?;
            }
            EntryKind::Symlink => {
                let target = meta.decrypt_symlink_target(keys).map_err(crypto_err)?;
                self.assemble_symlink(&path, &target)?;
            }
            EntryKind::Deleted => remove_entry(&path)?,
        }

        self.index.set_assembled(&meta.path_id)?;
        self.storage.prune_assembled(meta)?;
        debug!(path = %normalized, "assembled entry");
        info!(rev = %smeta.path_revision(), kind = ?meta.kind, "assembled");
        Ok(true)
    }

    fn assemble_file(&self, keys: &FolderKeys, meta: &MetaInfo, path: &Path) -> VaultResult<()> {
        let part = self.tmp_dir.join(format!("{}.part", meta.path_id.to_hex()));
        let mut file = fs::File::create(&part)?;
        for info in &meta.chunks {
            let ct = self.storage.get(&info.ct_hash)?;
            let pt = open_chunk(keys, info, &ct)
                .map_err(|e| VaultError::Verification(format!("{e:#}")))?;
            file.write_all(&pt)?;
        }
        file.set_modified(UNIX_EPOCH + Duration::from_secs(meta.mtime.max(0) as u64))?;
        file.sync_all()?;
        drop(file);
        set_mode(&part, meta.mode)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(path)?;
        }
        fs::rename(&part, path)?;
        debug!(path = %path.display(), size = meta.file_size(), "file written");
        Ok(())
    }

    #[cfg(unix)]
    fn assemble_symlink(&self, path: &Path, target: &str) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_entry(path)?;
        std::os::unix::fs::symlink(target, path)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn assemble_symlink(&self, path: &Path, target: &str) -> VaultResult<()> {
        debug!(path = %path.display(), %target, "symlink skipped");
        warn!("symlinks unsupported on this platform, skipping");
        Ok(())
    }

    /// Try every meta still waiting for assembly. Returns how many completed.
    pub fn assemble_pending(&self) -> usize {
        let mut done = 0;
        for smeta in self.index.incomplete_meta() {
            match self.assemble(&smeta) {
                Ok(true) => done += 1,
                Ok(false) => {}
                Err(e) => warn!(rev = %smeta.path_revision(), "assembly failed: {e}"),
            }
        }
        done
    }
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if md.is_dir() {
        // Children carry their own Deleted metas
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(path = %path.display(), "directory not removed");
                warn!("deleted directory not removed: {e}");
                Ok(())
            }
        }
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
