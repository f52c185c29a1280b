//! Persistent catalogue of accepted `SignedMeta` revisions.
//!
//! Two backends are available:
//!   - **JSON** (default): atomic snapshot rewrite per transaction.
//!   - **RocksDB** (behind `rocksdb` feature): one `WriteBatch` per transaction.
//!
//! Every mutation is a list of `RowOp`s applied to the in-memory tables and
//! committed as one unit. If the commit fails the tables are restored to their
//! image from before the transaction, so a meta is never visible without its
//! chunk rows.

mod json;
#[cfg(feature = "rocksdb")]
mod rocks;
pub mod tables;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vs_core::{CtHash, PathId, VaultError, VaultResult};
use vs_crypto::{EntryKind, PathRevision, Secret, SignedMeta, IV_SIZE};

use json::JsonIndexStore;
#[cfg(feature = "rocksdb")]
use rocks::RocksIndexStore;
use tables::{ChunkRecord, IndexTables, MetaRecord, RowOp};

const EVENT_CAPACITY: usize = 1024;

/// Notifications emitted after a meta is committed.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    /// Produced locally; the plaintext already matches it
    MetaAdded(SignedMeta),
    /// Received from a peer; still needs chunks and assembly
    MetaAddedExternal(SignedMeta),
}

impl IndexEvent {
    pub fn smeta(&self) -> &SignedMeta {
        match self {
            IndexEvent::MetaAdded(s) | IndexEvent::MetaAddedExternal(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMetaOutcome {
    Accepted,
    /// Equal or older revision; nothing changed
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackendKind {
    Json,
    RocksDb,
}

impl FromStr for IndexBackendKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(IndexBackendKind::Json),
            "rocksdb" => Ok(IndexBackendKind::RocksDb),
            other => Err(VaultError::Config(format!("unknown index backend: {other}"))),
        }
    }
}

enum IndexStore {
    Json(JsonIndexStore),
    #[cfg(feature = "rocksdb")]
    Rocks(RocksIndexStore),
}

impl IndexStore {
    fn open(dir: &Path, kind: IndexBackendKind) -> anyhow::Result<Self> {
        #[cfg(feature = "rocksdb")]
        if kind == IndexBackendKind::RocksDb {
            return Ok(IndexStore::Rocks(RocksIndexStore::open(dir)?));
        }

        #[cfg(not(feature = "rocksdb"))]
        if kind == IndexBackendKind::RocksDb {
            warn!("RocksDB not compiled in (missing 'rocksdb' feature), falling back to JSON index");
        }

        Ok(IndexStore::Json(JsonIndexStore::open(dir)))
    }

    fn load(&self) -> anyhow::Result<IndexTables> {
        match self {
            IndexStore::Json(s) => s.load(),
            #[cfg(feature = "rocksdb")]
            IndexStore::Rocks(s) => s.load(),
        }
    }

    #[cfg_attr(not(feature = "rocksdb"), allow(unused_variables))]
    fn commit(&mut self, ops: &[RowOp], tables: &IndexTables) -> anyhow::Result<()> {
        match self {
            IndexStore::Json(s) => s.commit(tables),
            #[cfg(feature = "rocksdb")]
            IndexStore::Rocks(s) => s.commit(ops, tables),
        }
    }
}

struct IndexState {
    tables: IndexTables,
    store: IndexStore,
}

pub struct Index {
    secret: Secret,
    dir: PathBuf,
    state: RwLock<IndexState>,
    events: broadcast::Sender<IndexEvent>,
}

fn index_err(e: anyhow::Error) -> VaultError {
    VaultError::Index(format!("{e:#}"))
}

impl Index {
    /// Open the index stored under `system_path`.
    ///
    /// The directory carries a `folder-id` marker; if it names another folder
    /// the stored rows belong to a different secret and are wiped.
    pub fn open(system_path: &Path, secret: &Secret, kind: IndexBackendKind) -> VaultResult<Self> {
        fs::create_dir_all(system_path)?;
        let store = IndexStore::open(system_path, kind).map_err(index_err)?;
        let tables = store.load().map_err(index_err)?;

        let index = Index {
            secret: secret.clone(),
            dir: system_path.to_path_buf(),
            state: RwLock::new(IndexState { tables, store }),
            events: broadcast::channel(EVENT_CAPACITY).0,
        };

        let marker = system_path.join("folder-id");
        let folder_id = secret.folder_id_hex();
        match fs::read_to_string(&marker) {
            Ok(stored) if stored.trim().eq_ignore_ascii_case(&folder_id) => {}
            Ok(stored) => {
                warn!(stored = %stored.trim(), current = %folder_id, "index belongs to another folder, wiping");
                index.wipe()?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::write(&marker, &folder_id)?;

        info!(
            path = %system_path.display(),
            metas = index.meta_count(),
            backend = ?kind,
            "index opened"
        );
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Apply and commit `ops` as one transaction.
    fn transact(&self, state: &mut IndexState, ops: &[RowOp]) -> VaultResult<()> {
        let before = state.tables.clone();
        for op in ops {
            state.tables.apply(op);
        }
        if let Err(e) = state.store.commit(ops, &state.tables) {
            // The last committed image still matches `before`
            state.tables = before;
            return Err(index_err(e));
        }
        Ok(())
    }

    pub fn have_meta(&self, rev: &PathRevision) -> bool {
        let state = self.state.read();
        state
            .tables
            .meta
            .get(&rev.path_id)
            .is_some_and(|r| r.smeta.meta().revision == rev.revision)
    }

    /// True iff `rev` strictly dominates the stored revision for its path.
    pub fn put_allowed(&self, rev: &PathRevision) -> bool {
        let state = self.state.read();
        Self::put_allowed_in(&state.tables, rev)
    }

    fn put_allowed_in(tables: &IndexTables, rev: &PathRevision) -> bool {
        tables
            .meta
            .get(&rev.path_id)
            .map_or(true, |r| rev.dominates(r.smeta.meta().revision))
    }

    /// Store a meta if its signature is valid and its revision is newer.
    ///
    /// `fully_assembled` marks metas produced by the local indexer, whose
    /// chunks already exist in the plaintext tree.
    pub fn put_meta(&self, smeta: &SignedMeta, fully_assembled: bool) -> VaultResult<PutMetaOutcome> {
        let rev = smeta.path_revision();
        if !smeta.is_valid(&self.secret) {
            return Err(VaultError::Verification(format!(
                "bad signature on meta {rev}"
            )));
        }

        {
            let mut state = self.state.write();
            if !Self::put_allowed_in(&state.tables, &rev) {
                debug!(%rev, "stale meta ignored");
                return Ok(PutMetaOutcome::Stale);
            }

            let mut ops = vec![RowOp::PutMeta(
                rev.path_id,
                MetaRecord {
                    smeta: smeta.clone(),
                    assembled: fully_assembled,
                },
            )];
            ops.extend(smeta.meta().chunks.iter().map(|c| {
                RowOp::PutChunk(
                    c.ct_hash,
                    ChunkRecord {
                        size: c.size,
                        iv: c.iv,
                    },
                )
            }));
            self.transact(&mut state, &ops)?;
        }

        debug!(
            %rev,
            kind = ?smeta.meta().kind,
            fully_assembled,
            "meta added"
        );
        let event = if fully_assembled {
            IndexEvent::MetaAdded(smeta.clone())
        } else {
            IndexEvent::MetaAddedExternal(smeta.clone())
        };
        // No subscribers is fine
        let _ = self.events.send(event);
        Ok(PutMetaOutcome::Accepted)
    }

    /// The meta stored for exactly this path and revision.
    pub fn get_meta(&self, rev: &PathRevision) -> VaultResult<SignedMeta> {
        let smeta = self.get_meta_by_path(&rev.path_id)?;
        if smeta.meta().revision != rev.revision {
            return Err(VaultError::MetaNotFound(rev.path_id));
        }
        Ok(smeta)
    }

    /// The latest meta stored for a path.
    pub fn get_meta_by_path(&self, path_id: &PathId) -> VaultResult<SignedMeta> {
        let state = self.state.read();
        state
            .tables
            .meta
            .get(path_id)
            .map(|r| r.smeta.clone())
            .ok_or(VaultError::MetaNotFound(*path_id))
    }

    fn collect_meta(&self, filter: impl Fn(&MetaRecord) -> bool) -> Vec<SignedMeta> {
        let state = self.state.read();
        let mut out: Vec<SignedMeta> = state
            .tables
            .meta
            .values()
            .filter(|r| filter(r))
            .map(|r| r.smeta.clone())
            .collect();
        out.sort_by_key(|s| s.path_revision());
        out
    }

    pub fn all_meta(&self) -> Vec<SignedMeta> {
        self.collect_meta(|_| true)
    }

    /// Non-deleted entries whose plaintext is in place.
    pub fn existing_meta(&self) -> Vec<SignedMeta> {
        self.collect_meta(|r| r.kind() != EntryKind::Deleted && r.assembled)
    }

    /// Entries still waiting for chunks or assembly.
    pub fn incomplete_meta(&self) -> Vec<SignedMeta> {
        self.collect_meta(|r| !r.assembled)
    }

    pub fn meta_count(&self) -> usize {
        self.state.read().tables.meta.len()
    }

    /// Current metas whose chunk list references `ct_hash`.
    pub fn containing_chunk(&self, ct_hash: &CtHash) -> Vec<SignedMeta> {
        let state = self.state.read();
        let metas = state
            .tables
            .containing(ct_hash)
            .map(|r| r.smeta.clone())
            .collect();
        metas
    }

    /// Whether any current meta still references `ct_hash`.
    pub fn is_referenced(&self, ct_hash: &CtHash) -> bool {
        self.state.read().tables.containing(ct_hash).next().is_some()
    }

    pub fn set_assembled(&self, path_id: &PathId) -> VaultResult<()> {
        let mut state = self.state.write();
        if !state.tables.meta.contains_key(path_id) {
            return Err(VaultError::MetaNotFound(*path_id));
        }
        self.transact(&mut state, &[RowOp::SetAssembled(*path_id)])
    }

    /// Whether the plaintext of `ct_hash` exists in some assembled file.
    pub fn is_chunk_assembled(&self, ct_hash: &CtHash) -> bool {
        let state = self.state.read();
        let found = state
            .tables
            .containing(ct_hash)
            .any(|r| r.assembled && r.kind() == EntryKind::File);
        found
    }

    pub fn chunk_size_iv(&self, ct_hash: &CtHash) -> VaultResult<(u32, [u8; IV_SIZE])> {
        let state = self.state.read();
        state
            .tables
            .chunk
            .get(ct_hash)
            .map(|r| (r.size, r.iv))
            .ok_or(VaultError::NoSuchChunk(*ct_hash))
    }

    /// Drop every row.
    pub fn wipe(&self) -> VaultResult<()> {
        let mut state = self.state.write();
        self.transact(&mut state, &[RowOp::Clear])?;
        info!(path = %self.dir.display(), "index wiped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vs_crypto::{ChunkInfo, MetaInfo, SecretLevel};

    fn meta(path: u8, revision: u64, kind: EntryKind, hashes: &[u8]) -> MetaInfo {
        MetaInfo {
            path_id: PathId::from_bytes([path; 32]),
            revision,
            kind,
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
                    size: 100 + h as u32,
                    iv: [h; IV_SIZE],
                    pt_hmac: [h; 32],
                })
                .collect(),
        }
    }

    fn signed(secret: &Secret, path: u8, revision: u64, hashes: &[u8]) -> SignedMeta {
        SignedMeta::sign(meta(path, revision, EntryKind::File, hashes), secret).unwrap()
    }

    fn open(dir: &Path, secret: &Secret) -> Index {
        Index::open(dir, secret, IndexBackendKind::Json).unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);

        let smeta = signed(&secret, 1, 5, &[10, 11]);
        assert_eq!(index.put_meta(&smeta, false).unwrap(), PutMetaOutcome::Accepted);

        let rev = smeta.path_revision();
        assert!(index.have_meta(&rev));
        assert_eq!(index.get_meta(&rev).unwrap(), smeta);
        assert!(!index.have_meta(&PathRevision::new(rev.path_id, 4)));
        assert!(matches!(
            index.get_meta(&PathRevision::new(rev.path_id, 4)),
            Err(VaultError::MetaNotFound(_))
        ));
        assert_eq!(
            index.chunk_size_iv(&CtHash::from_bytes([10; 32])).unwrap(),
            (110, [10; IV_SIZE])
        );
        assert!(index.chunk_size_iv(&CtHash::from_bytes([99; 32])).is_err());
    }

    #[test]
    fn test_out_of_order_revisions_converge() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);
        let metas: Vec<_> = (1..=3).map(|r| signed(&secret, 1, r, &[r as u8])).collect();

        assert_eq!(index.put_meta(&metas[1], false).unwrap(), PutMetaOutcome::Accepted);
        assert_eq!(index.put_meta(&metas[0], false).unwrap(), PutMetaOutcome::Stale);
        assert_eq!(index.put_meta(&metas[2], false).unwrap(), PutMetaOutcome::Accepted);
        assert_eq!(index.put_meta(&metas[1], false).unwrap(), PutMetaOutcome::Stale);
        assert_eq!(index.put_meta(&metas[2], false).unwrap(), PutMetaOutcome::Stale);

        let stored = index.get_meta_by_path(&PathId::from_bytes([1; 32])).unwrap();
        assert_eq!(stored.meta().revision, 3);
        assert_eq!(index.meta_count(), 1);
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let other = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);

        let forged = signed(&other, 1, 1, &[]);
        assert!(matches!(
            index.put_meta(&forged, false),
            Err(VaultError::Verification(_))
        ));
        assert_eq!(index.meta_count(), 0);
    }

    #[test]
    fn test_chunk_assembly_and_containing() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);
        let shared = CtHash::from_bytes([7; 32]);

        index.put_meta(&signed(&secret, 1, 1, &[7, 8]), false).unwrap();
        index.put_meta(&signed(&secret, 2, 1, &[7]), false).unwrap();

        assert_eq!(index.containing_chunk(&shared).len(), 2);
        assert!(!index.is_chunk_assembled(&shared));
        assert_eq!(index.incomplete_meta().len(), 2);

        index.set_assembled(&PathId::from_bytes([2; 32])).unwrap();
        assert!(index.is_chunk_assembled(&shared));
        assert!(!index.is_chunk_assembled(&CtHash::from_bytes([8; 32])));
        assert_eq!(index.existing_meta().len(), 1);
        assert_eq!(index.incomplete_meta().len(), 1);

        assert!(index.set_assembled(&PathId::from_bytes([9; 32])).is_err());
    }

    #[test]
    fn test_superseded_meta_releases_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);

        index.put_meta(&signed(&secret, 1, 1, &[1, 2]), false).unwrap();
        index.put_meta(&signed(&secret, 1, 2, &[2, 3]), false).unwrap();

        assert!(!index.is_referenced(&CtHash::from_bytes([1; 32])));
        assert!(index.is_referenced(&CtHash::from_bytes([2; 32])));
        assert!(index.is_referenced(&CtHash::from_bytes([3; 32])));
    }

    #[test]
    fn test_deleted_is_not_existing() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);
        let deleted = SignedMeta::sign(meta(4, 1, EntryKind::Deleted, &[]), &secret).unwrap();
        index.put_meta(&deleted, true).unwrap();
        assert!(index.existing_meta().is_empty());
        assert_eq!(index.all_meta().len(), 1);
    }

    #[test]
    fn test_events_distinguish_origin() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);
        let mut rx = index.subscribe();

        index.put_meta(&signed(&secret, 1, 1, &[]), true).unwrap();
        index.put_meta(&signed(&secret, 2, 1, &[]), false).unwrap();
        index.put_meta(&signed(&secret, 2, 1, &[]), false).unwrap(); // stale, no event

        assert!(matches!(rx.try_recv().unwrap(), IndexEvent::MetaAdded(_)));
        assert!(matches!(rx.try_recv().unwrap(), IndexEvent::MetaAddedExternal(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let smeta = signed(&secret, 1, 3, &[5]);
        {
            let index = open(dir.path(), &secret);
            index.put_meta(&smeta, false).unwrap();
            index.set_assembled(&smeta.meta().path_id).unwrap();
        }
        let index = open(dir.path(), &secret);
        assert!(index.have_meta(&smeta.path_revision()));
        assert!(index.is_chunk_assembled(&CtHash::from_bytes([5; 32])));
    }

    #[test]
    fn test_reopen_with_other_folder_wipes() {
        let dir = tempfile::tempdir().unwrap();
        let a = Secret::generate().unwrap();
        {
            let index = open(dir.path(), &a);
            index.put_meta(&signed(&a, 1, 1, &[]), false).unwrap();
        }
        // Same folder at a lower level keeps its rows
        let ro = a.derive(SecretLevel::ReadOnly).unwrap();
        assert_eq!(open(dir.path(), &ro).meta_count(), 1);

        let b = Secret::generate().unwrap();
        assert_eq!(open(dir.path(), &b).meta_count(), 0);
    }

    #[test]
    fn test_failed_commit_keeps_prior_rows() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate().unwrap();
        let index = open(dir.path(), &secret);
        let first = signed(&secret, 1, 1, &[5]);
        index.put_meta(&first, false).unwrap();

        // A directory in place of the snapshot breaks both rename and read
        let snapshot = dir.path().join("index.json");
        fs::remove_file(&snapshot).unwrap();
        fs::create_dir(&snapshot).unwrap();
        fs::write(snapshot.join("blocker"), b"x").unwrap();

        let second = signed(&secret, 2, 1, &[6]);
        assert!(matches!(index.put_meta(&second, false), Err(VaultError::Index(_))));
        assert!(index.have_meta(&first.path_revision()));
        assert!(!index.have_meta(&second.path_revision()));
        assert!(index.is_referenced(&CtHash::from_bytes([5; 32])));

        fs::remove_dir_all(&snapshot).unwrap();
        let third = signed(&secret, 3, 1, &[7]);
        index.put_meta(&third, false).unwrap();
        drop(index);

        let index = open(dir.path(), &secret);
        assert!(index.have_meta(&first.path_revision()));
        assert!(!index.have_meta(&second.path_revision()));
        assert!(index.have_meta(&third.path_revision()));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("json".parse::<IndexBackendKind>().unwrap(), IndexBackendKind::Json);
        assert_eq!("rocksdb".parse::<IndexBackendKind>().unwrap(), IndexBackendKind::RocksDb);
        assert!("sqlite".parse::<IndexBackendKind>().is_err());
    }
}
