//! RocksDB index backend, same contract as the JSON snapshot.
#![cfg(feature = "rocksdb")]

use vs_core::{CtHash, PathId};
use vs_crypto::{ChunkInfo, EntryKind, MetaInfo, PathRevision, Secret, SignedMeta, IV_SIZE};
use vs_storage::{Index, IndexBackendKind, PutMetaOutcome};

fn signed(secret: &Secret, path: u8, revision: u64, hashes: &[u8]) -> SignedMeta {
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
                size: 64,
                iv: [h; IV_SIZE],
                pt_hmac: [h; 32],
            })
            .collect(),
    };
    SignedMeta::sign(meta, secret).unwrap()
}

#[test]
fn test_rocksdb_roundtrip_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let secret = Secret::generate().unwrap();
    let smeta = signed(&secret, 1, 2, &[3, 4]);
    {
        let index = Index::open(dir.path(), &secret, IndexBackendKind::RocksDb).unwrap();
        assert_eq!(index.put_meta(&smeta, false).unwrap(), PutMetaOutcome::Accepted);
        assert_eq!(
            index.put_meta(&signed(&secret, 1, 1, &[]), false).unwrap(),
            PutMetaOutcome::Stale
        );
        index.set_assembled(&smeta.meta().path_id).unwrap();
    }

    let index = Index::open(dir.path(), &secret, IndexBackendKind::RocksDb).unwrap();
    assert!(index.have_meta(&PathRevision::new(PathId::from_bytes([1; 32]), 2)));
    assert!(index.is_chunk_assembled(&CtHash::from_bytes([3; 32])));
    assert_eq!(index.chunk_size_iv(&CtHash::from_bytes([4; 32])).unwrap().0, 64);

    index.wipe().unwrap();
    assert_eq!(index.meta_count(), 0);
}
