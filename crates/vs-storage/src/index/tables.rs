//! In-memory image of the index plus the row operations that mutate it.
//!
//! Persisted rows are `meta` (one per path) and `chunk` (size/iv per
//! ct_hash). The `openfs` relation (which paths contain which chunk) is
//! derived from the meta rows and rebuilt on load.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use vs_core::types::hex_array;
use vs_core::{CtHash, PathId};
use vs_crypto::{EntryKind, SignedMeta, IV_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub smeta: SignedMeta,
    pub assembled: bool,
}

impl MetaRecord {
    pub fn kind(&self) -> EntryKind {
        self.smeta.meta().kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub size: u32,
    #[serde(with = "hex_array")]
    pub iv: [u8; IV_SIZE],
}

/// One mutation inside an index transaction.
#[derive(Debug, Clone)]
pub enum RowOp {
    PutMeta(PathId, MetaRecord),
    /// Insert-or-ignore
    PutChunk(CtHash, ChunkRecord),
    SetAssembled(PathId),
    Clear,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IndexTables {
    pub meta: HashMap<PathId, MetaRecord>,
    pub chunk: HashMap<CtHash, ChunkRecord>,
    #[serde(skip)]
    openfs: HashMap<CtHash, BTreeSet<PathId>>,
}

impl IndexTables {
    pub fn from_rows(
        meta: impl IntoIterator<Item = (PathId, MetaRecord)>,
        chunk: impl IntoIterator<Item = (CtHash, ChunkRecord)>,
    ) -> Self {
        let mut tables = IndexTables {
            meta: meta.into_iter().collect(),
            chunk: chunk.into_iter().collect(),
            openfs: HashMap::new(),
        };
        tables.rebuild_openfs();
        tables
    }

    pub fn rebuild_openfs(&mut self) {
        self.openfs.clear();
        let links: Vec<(CtHash, PathId)> = self
            .meta
            .iter()
            .flat_map(|(path_id, rec)| {
                rec.smeta
                    .meta()
                    .chunks
                    .iter()
                    .map(move |c| (c.ct_hash, *path_id))
            })
            .collect();
        for (ct_hash, path_id) in links {
            self.openfs.entry(ct_hash).or_default().insert(path_id);
        }
    }

    fn unlink(&mut self, path_id: &PathId) {
        let Some(old) = self.meta.get(path_id) else {
            return;
        };
        let hashes: Vec<CtHash> = old.smeta.meta().chunks.iter().map(|c| c.ct_hash).collect();
        for ct_hash in hashes {
            if let Some(paths) = self.openfs.get_mut(&ct_hash) {
                paths.remove(path_id);
                if paths.is_empty() {
                    self.openfs.remove(&ct_hash);
                }
            }
        }
    }

    pub fn apply(&mut self, op: &RowOp) {
        match op {
            RowOp::PutMeta(path_id, rec) => {
                self.unlink(path_id);
                for c in &rec.smeta.meta().chunks {
                    self.openfs.entry(c.ct_hash).or_default().insert(*path_id);
                }
                self.meta.insert(*path_id, rec.clone());
            }
            RowOp::PutChunk(ct_hash, rec) => {
                self.chunk.entry(*ct_hash).or_insert(*rec);
            }
            RowOp::SetAssembled(path_id) => {
                if let Some(rec) = self.meta.get_mut(path_id) {
                    rec.assembled = true;
                }
            }
            RowOp::Clear => {
                self.meta.clear();
                self.chunk.clear();
                self.openfs.clear();
            }
        }
    }

    /// Paths whose current meta references `ct_hash`.
    pub fn containing(&self, ct_hash: &CtHash) -> impl Iterator<Item = &MetaRecord> {
        self.openfs
            .get(ct_hash)
            .into_iter()
            .flatten()
            .filter_map(|path_id| self.meta.get(path_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vs_crypto::{ChunkInfo, MetaInfo, Secret};

    fn record(secret: &Secret, path: u8, revision: u64, hashes: &[u8]) -> MetaRecord {
        let meta = MetaInfo {
            path_id: PathId::from_bytes([path; 32]),
            revision,
            kind: EntryKind::File,
            encrypted_path: vec![path],
            mtime: 0,
            mode: 0o644,
            symlink_target: None,
            min_chunksize: 0,
            max_chunksize: 0,
            chunks: hashes
                .iter()
                .map(|&h| ChunkInfo {
                    ct_hash: CtHash::from_bytes([h; 32]),
                    size: 10,
                    iv: [h; IV_SIZE],
                    pt_hmac: [h; 32],
                })
                .collect(),
        };
        MetaRecord {
            smeta: SignedMeta::sign(meta, secret).unwrap(),
            assembled: false,
        }
    }

    #[test]
    fn test_replacing_meta_relinks_chunks() {
        let secret = Secret::generate().unwrap();
        let mut t = IndexTables::default();
        let path = PathId::from_bytes([1; 32]);

        t.apply(&RowOp::PutMeta(path, record(&secret, 1, 1, &[10, 11])));
        assert_eq!(t.containing(&CtHash::from_bytes([10; 32])).count(), 1);

        t.apply(&RowOp::PutMeta(path, record(&secret, 1, 2, &[11, 12])));
        assert_eq!(t.containing(&CtHash::from_bytes([10; 32])).count(), 0);
        assert_eq!(t.containing(&CtHash::from_bytes([11; 32])).count(), 1);
        assert_eq!(t.containing(&CtHash::from_bytes([12; 32])).count(), 1);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let secret = Secret::generate().unwrap();
        let mut t = IndexTables::default();
        t.apply(&RowOp::PutMeta(PathId::from_bytes([1; 32]), record(&secret, 1, 1, &[5])));
        t.apply(&RowOp::PutMeta(PathId::from_bytes([2; 32]), record(&secret, 2, 1, &[5, 6])));

        let rebuilt = IndexTables::from_rows(t.meta.clone(), t.chunk.clone());
        assert_eq!(rebuilt.openfs, t.openfs);
        assert_eq!(rebuilt.containing(&CtHash::from_bytes([5; 32])).count(), 2);
    }

    #[test]
    fn test_put_chunk_is_insert_or_ignore() {
        let mut t = IndexTables::default();
        let h = CtHash::from_bytes([1; 32]);
        t.apply(&RowOp::PutChunk(h, ChunkRecord { size: 1, iv: [1; IV_SIZE] }));
        t.apply(&RowOp::PutChunk(h, ChunkRecord { size: 2, iv: [2; IV_SIZE] }));
        assert_eq!(t.chunk[&h].size, 1);
    }

    #[test]
    fn test_clear() {
        let secret = Secret::generate().unwrap();
        let mut t = IndexTables::default();
        t.apply(&RowOp::PutMeta(PathId::from_bytes([1; 32]), record(&secret, 1, 1, &[5])));
        t.apply(&RowOp::Clear);
        assert!(t.meta.is_empty());
        assert_eq!(t.containing(&CtHash::from_bytes([5; 32])).count(), 0);
    }
}
