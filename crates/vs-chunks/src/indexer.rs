//! Local indexer: filesystem entry -> `SignedMeta`
//!
//! Reads an entry under the folder root, chunks file content with FastCDC,
//! encrypts chunks in parallel, and signs the resulting meta. Only secrets
//! that can sign (Owner / ReadWrite) may index.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::debug;
use vs_core::{Bitfield, PathId};
use vs_crypto::chunk::seal_chunk;
use vs_crypto::names::{encrypt_path, normalize_path, path_id};
use vs_crypto::{EncryptedChunk, EntryKind, MetaInfo, Secret, SignedMeta};

use crate::fastcdc::{chunk_data, ChunkSizes};

/// Result of indexing one entry.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub smeta: SignedMeta,
    /// Ciphertext of every chunk, in meta order
    pub chunks: Vec<EncryptedChunk>,
}

impl IndexedEntry {
    /// Locally indexed entries hold every chunk.
    pub fn bitfield(&self) -> Bitfield {
        vec![true; self.smeta.meta().chunks.len()]
    }
}

pub struct Indexer {
    secret: Secret,
    root: PathBuf,
    sizes: ChunkSizes,
}

/// Next revision for a path: wall-clock microseconds, strictly above `previous`.
pub fn next_revision(previous: Option<u64>) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    match previous {
        Some(prev) => now.max(prev.saturating_add(1)),
        None => now.max(1),
    }
}

impl Indexer {
    pub fn new(secret: Secret, root: impl Into<PathBuf>, sizes: ChunkSizes) -> Result<Self> {
        if !secret.can_sign() {
            anyhow::bail!("secret level {:?} cannot index local changes", secret.level());
        }
        Ok(Self {
            secret,
            root: root.into(),
            sizes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn normalize(&self, path: &Path) -> Result<String> {
        normalize_path(&self.root, path)
            .with_context(|| format!("path outside folder: {}", path.display()))
    }

    pub fn path_id_of(&self, path: &Path) -> Result<PathId> {
        let keys = self.secret.keys()?;
        Ok(path_id(keys, &self.normalize(path)?))
    }

    /// Index the current state of `path`. A missing path yields a Deleted meta.
    pub fn index_entry(&self, path: &Path, previous_revision: Option<u64>) -> Result<IndexedEntry> {
        let keys = self.secret.keys()?;
        let normalized = self.normalize(path)?;

        let mut meta = MetaInfo {
            path_id: path_id(keys, &normalized),
            revision: next_revision(previous_revision),
            kind: EntryKind::Deleted,
            encrypted_path: encrypt_path(keys, &normalized)?,
            mtime: 0,
            mode: 0,
            symlink_target: None,
            min_chunksize: 0,
            max_chunksize: 0,
            chunks: Vec::new(),
        };
        let mut chunks = Vec::new();

        match fs::symlink_metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("stat: {}", path.display())),
            Ok(md) => {
                meta.mtime = md
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                meta.mode = unix_mode(&md);

                let ft = md.file_type();
                if ft.is_symlink() {
                    let target = fs::read_link(path)
                        .with_context(|| format!("readlink: {}", path.display()))?;
                    meta.kind = EntryKind::Symlink;
                    meta.symlink_target =
                        Some(encrypt_path(keys, &target.to_string_lossy())?);
                } else if ft.is_dir() {
                    meta.kind = EntryKind::Directory;
                } else {
                    let data = fs::read(path)
                        .with_context(|| format!("reading file for indexing: {}", path.display()))?;
                    let boundaries = chunk_data(&data, self.sizes);
                    chunks = boundaries
                        .par_iter()
                        .map(|c| {
                            let start = c.offset as usize;
                            seal_chunk(keys, &data[start..start + c.length])
                        })
                        .collect::<Result<Vec<_>>>()?;
                    meta.kind = EntryKind::File;
                    meta.min_chunksize = self.sizes.min_size;
                    meta.max_chunksize = self.sizes.max_size;
                    meta.chunks = chunks.iter().map(|c| c.info.clone()).collect();
                }
            }
        }

        debug!(
            path_id = %meta.path_id,
            revision = meta.revision,
            kind = ?meta.kind,
            chunks = meta.chunks.len(),
            "indexed entry"
        );
        let smeta = SignedMeta::sign(meta, &self.secret)?;
        Ok(IndexedEntry { smeta, chunks })
    }
}

#[cfg(unix)]
fn unix_mode(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn unix_mode(md: &fs::Metadata) -> u32 {
    if md.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Collect every file, directory, and symlink under `root`, skipping `skip`
/// (the folder's system directory). Symlinks are not followed.
pub fn collect_entries(root: &Path, skip: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    collect_inner(root, skip, &mut out)?;
    out.sort(); // deterministic order
    Ok(out)
}

fn collect_inner(dir: &Path, skip: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading dir: {}", dir.display()))? {
        let entry = entry.context("reading dir entry")?;
        let path = entry.path();
        if path == skip {
            continue;
        }
        let ft = entry.file_type().context("stat dir entry")?;
        if ft.is_dir() {
            out.push(path.clone());
            collect_inner(&path, skip, out)?;
        } else if ft.is_file() || ft.is_symlink() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vs_crypto::{open_chunk, SecretLevel};

    fn indexer(root: &Path) -> Indexer {
        Indexer::new(Secret::generate().unwrap(), root, ChunkSizes::SMALL).unwrap()
    }

    #[test]
    fn test_index_file_roundtrips_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let idx = indexer(dir.path());
        let entry = idx.index_entry(&path, None).unwrap();
        let meta = entry.smeta.meta();

        assert_eq!(meta.kind, EntryKind::File);
        assert_eq!(meta.file_size(), content.len() as u64);
        assert!(entry.smeta.is_valid(&idx.secret));
        assert_eq!(entry.bitfield(), vec![true; meta.chunks.len()]);

        let keys = idx.secret.keys().unwrap();
        let mut rebuilt = Vec::new();
        for sealed in &entry.chunks {
            rebuilt.extend(open_chunk(keys, &sealed.info, &sealed.ciphertext).unwrap());
        }
        assert_eq!(rebuilt, content);
        assert_eq!(meta.decrypt_path(keys).unwrap(), "data.bin");
    }

    #[test]
    fn test_missing_path_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let idx = indexer(dir.path());
        let entry = idx.index_entry(&dir.path().join("gone.txt"), Some(10)).unwrap();
        assert_eq!(entry.smeta.meta().kind, EntryKind::Deleted);
        assert!(entry.smeta.meta().revision > 10);
    }

    #[test]
    fn test_directory_and_path_id() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let idx = indexer(dir.path());
        let entry = idx.index_entry(&sub, None).unwrap();
        assert_eq!(entry.smeta.meta().kind, EntryKind::Directory);
        assert_eq!(entry.smeta.meta().path_id, idx.path_id_of(&sub).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_target_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target/file", &link).unwrap();
        let idx = indexer(dir.path());
        let entry = idx.index_entry(&link, None).unwrap();
        let meta = entry.smeta.meta();
        assert_eq!(meta.kind, EntryKind::Symlink);
        assert_eq!(
            meta.decrypt_symlink_target(idx.secret.keys().unwrap()).unwrap(),
            "target/file"
        );
    }

    #[test]
    fn test_read_only_secret_cannot_index() {
        let ro = Secret::generate()
            .unwrap()
            .derive(SecretLevel::ReadOnly)
            .unwrap();
        assert!(Indexer::new(ro, "/tmp", ChunkSizes::SMALL).is_err());
    }

    #[test]
    fn test_next_revision_monotonic() {
        let a = next_revision(None);
        assert!(next_revision(Some(a)) > a);
        assert_eq!(next_revision(Some(u64::MAX - 1)), u64::MAX);
    }

    #[test]
    fn test_collect_entries_skips_system_dir() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join(".vaultsync");
        fs::create_dir_all(system.join("chunks")).unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let entries = collect_entries(dir.path(), &system).unwrap();
        assert_eq!(
            entries,
            vec![
                dir.path().join("b.txt"),
                dir.path().join("docs"),
                dir.path().join("docs/a.txt"),
            ]
        );
    }
}
