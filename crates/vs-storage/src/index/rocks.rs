//! RocksDB backend: rows live under `m:` (meta) and `c:` (chunk) key
//! prefixes; each index transaction is one `WriteBatch`.

use anyhow::{Context, Result};
use std::path::Path;

use vs_core::{CtHash, PathId};

use super::tables::{ChunkRecord, IndexTables, MetaRecord, RowOp};

const META_PREFIX: &[u8] = b"m:";
const CHUNK_PREFIX: &[u8] = b"c:";

fn meta_key(path_id: &PathId) -> Vec<u8> {
    [META_PREFIX, &path_id.as_bytes()[..]].concat()
}

fn chunk_key(ct_hash: &CtHash) -> Vec<u8> {
    [CHUNK_PREFIX, &ct_hash.as_bytes()[..]].concat()
}

pub struct RocksIndexStore {
    db: rocksdb::DB,
}

impl RocksIndexStore {
    /// Open or create the database at `dir/index.rocks`.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join("index.rocks");
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);

        let db = rocksdb::DB::open(&opts, &path)
            .with_context(|| format!("opening RocksDB: {}", path.display()))?;
        Ok(RocksIndexStore { db })
    }

    /// Load every committed row.
    pub fn load(&self) -> Result<IndexTables> {
        let mut meta = Vec::new();
        let mut chunk = Vec::new();
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, value) = item.context("iterating RocksDB index")?;
            if let Some(id) = key.strip_prefix(META_PREFIX) {
                let path_id = PathId::from_slice(id).context("malformed meta key")?;
                let rec: MetaRecord =
                    serde_json::from_slice(&value).context("parsing meta row")?;
                meta.push((path_id, rec));
            } else if let Some(id) = key.strip_prefix(CHUNK_PREFIX) {
                let ct_hash = CtHash::from_slice(id).context("malformed chunk key")?;
                let rec: ChunkRecord =
                    serde_json::from_slice(&value).context("parsing chunk row")?;
                chunk.push((ct_hash, rec));
            }
        }

        Ok(IndexTables::from_rows(meta, chunk))
    }

    /// Write `ops` atomically. `tables` is the image *after* applying them.
    pub fn commit(&mut self, ops: &[RowOp], tables: &IndexTables) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for op in ops {
            match op {
                RowOp::PutMeta(path_id, rec) => {
                    batch.put(meta_key(path_id), serde_json::to_vec(rec)?);
                }
                RowOp::PutChunk(ct_hash, _) => {
                    // insert-or-ignore: persist whatever the table kept
                    if let Some(rec) = tables.chunk.get(ct_hash) {
                        batch.put(chunk_key(ct_hash), serde_json::to_vec(rec)?);
                    }
                }
                RowOp::SetAssembled(path_id) => {
                    if let Some(rec) = tables.meta.get(path_id) {
                        batch.put(meta_key(path_id), serde_json::to_vec(rec)?);
                    }
                }
                RowOp::Clear => {
                    for item in self.db.iterator(rocksdb::IteratorMode::Start) {
                        let (key, _) = item.context("iterating RocksDB index")?;
                        batch.delete(key);
                    }
                }
            }
        }
        self.db.write(batch).context("RocksDB write batch failed")?;
        Ok(())
    }
}
