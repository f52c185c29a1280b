//! Per-chunk download state.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vs_core::availability::AvailabilityError;
use vs_core::{AvailabilityMap, CtHash};
use vs_crypto::compute_ct_hash;

use crate::remote::{InterestGuard, RemoteId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub remote: RemoteId,
    pub offset: u32,
    pub size: u32,
    pub sent_at: Instant,
}

/// Random-access sink for received ciphertext blocks.
///
/// The temp file is created on the first block and removed on drop unless
/// it was moved away by chunk storage.
pub struct ChunkFileBuilder {
    path: PathBuf,
    map: AvailabilityMap<u32>,
}

impl ChunkFileBuilder {
    pub fn new(dir: &Path, ct_hash: &CtHash, size: u32) -> Self {
        ChunkFileBuilder {
            path: dir.join(format!("{}.part", ct_hash.to_hex())),
            map: AvailabilityMap::new(size),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn map(&self) -> &AvailabilityMap<u32> {
        &self.map
    }

    pub fn complete(&self) -> bool {
        self.map.full()
    }

    /// Write `data` at `offset` and mark the range received.
    ///
    /// Out-of-bounds or already received ranges are rejected before any
    /// byte is written.
    pub fn put_block(&mut self, offset: u32, data: &[u8]) -> io::Result<Result<(), AvailabilityError>> {
        let Ok(len) = u32::try_from(data.len()) else {
            return Ok(Err(AvailabilityError::OutOfBounds {
                offset: offset as u64,
                len: data.len() as u64,
                size: self.map.size() as u64,
            }));
        };
        if let Err(e) = self.map.check_insert(offset, len) {
            return Ok(Err(e));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)?;
        Ok(self.map.insert(offset, len))
    }

    /// Hash of the assembled ciphertext.
    pub fn ct_hash(&self) -> io::Result<CtHash> {
        let data = fs::read(&self.path)?;
        Ok(compute_ct_hash(&data[..data.len().min(self.map.size() as usize)]))
    }

    /// Forget every received byte.
    pub fn reset(&mut self) {
        self.map.reset();
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for ChunkFileBuilder {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct DownloadChunk {
    pub ct_hash: CtHash,
    /// Ciphertext length
    pub size: u32,
    pub builder: ChunkFileBuilder,
    pub requests: Vec<BlockRequest>,
    /// Peers advertising this chunk, each holding our interest
    pub owned_by: HashMap<RemoteId, Arc<InterestGuard>>,
    /// Timed-out requests per peer; higher means asked later
    pub timeouts: HashMap<RemoteId, u32>,
    /// Peers whose blocks are in the current assembly
    pub contributors: HashSet<RemoteId>,
    /// Assemblies that failed verification, per contributing peer
    pub failures: HashMap<RemoteId, u32>,
}

impl DownloadChunk {
    pub fn new(dir: &Path, ct_hash: CtHash, size: u32) -> Self {
        DownloadChunk {
            ct_hash,
            size,
            builder: ChunkFileBuilder::new(dir, &ct_hash, size),
            requests: Vec::new(),
            owned_by: HashMap::new(),
            timeouts: HashMap::new(),
            contributors: HashSet::new(),
            failures: HashMap::new(),
        }
    }

    /// Next range nobody has delivered or been asked for, capped at `block_size`.
    pub fn next_request_range(&self, block_size: u32) -> Option<(u32, u32)> {
        let mut map = self.builder.map().clone();
        for req in &self.requests {
            let _ = map.insert(req.offset, req.size);
        }
        map.first_missing()
            .map(|(offset, len)| (offset, len.min(block_size.max(1))))
    }

    pub fn add_request(&mut self, remote: RemoteId, offset: u32, size: u32, now: Instant) {
        self.requests.push(BlockRequest {
            remote,
            offset,
            size,
            sent_at: now,
        });
    }

    /// Remove the request a block answers. True if one matched.
    pub fn complete_request(&mut self, remote: RemoteId, offset: u32, size: u32) -> bool {
        let before = self.requests.len();
        self.requests
            .retain(|r| !(r.remote == remote && r.offset == offset && r.size == size));
        self.requests.len() != before
    }

    /// Drop requests older than `timeout`, returning the peers that missed them.
    pub fn expire_requests(&mut self, now: Instant, timeout: Duration) -> Vec<RemoteId> {
        let mut expired = Vec::new();
        self.requests.retain(|r| {
            if now.duration_since(r.sent_at) >= timeout {
                expired.push(r.remote);
                false
            } else {
                true
            }
        });
        for remote in &expired {
            *self.timeouts.entry(*remote).or_default() += 1;
        }
        expired
    }

    /// Drop a received assembly that did not hash to `ct_hash`.
    ///
    /// Every peer that contributed a block is charged one failure and
    /// returned; outstanding requests stay valid.
    pub fn discard_assembly(&mut self) -> Vec<RemoteId> {
        let mut blamed: Vec<RemoteId> = self.contributors.drain().collect();
        blamed.sort();
        for remote in &blamed {
            *self.failures.entry(*remote).or_default() += 1;
        }
        self.builder.reset();
        blamed
    }

    /// Forget everything recorded about `remote`.
    pub fn forget_remote(&mut self, remote: RemoteId) {
        self.release_remote(remote);
        self.timeouts.remove(&remote);
        self.failures.remove(&remote);
        self.contributors.remove(&remote);
        self.owned_by.remove(&remote);
    }

    pub fn release_remote(&mut self, remote: RemoteId) -> usize {
        let before = self.requests.len();
        self.requests.retain(|r| r.remote != remote);
        before - self.requests.len()
    }

    pub fn requests_to(&self, remote: RemoteId) -> usize {
        self.requests.iter().filter(|r| r.remote == remote).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ranges_skip_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = DownloadChunk::new(dir.path(), CtHash::from_bytes([1; 32]), 3000);
        let now = Instant::now();

        assert_eq!(chunk.next_request_range(1500), Some((0, 1500)));
        chunk.add_request(RemoteId(1), 0, 1500, now);
        assert_eq!(chunk.next_request_range(1500), Some((1500, 1500)));
        chunk.add_request(RemoteId(2), 1500, 1500, now);
        assert_eq!(chunk.next_request_range(1500), None);

        // Releasing a peer makes its range requestable again
        assert_eq!(chunk.release_remote(RemoteId(1)), 1);
        assert_eq!(chunk.next_request_range(4000), Some((0, 1500)));
    }

    #[test]
    fn test_expiry_counts_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = DownloadChunk::new(dir.path(), CtHash::from_bytes([1; 32]), 100);
        let start = Instant::now();
        chunk.add_request(RemoteId(7), 0, 100, start);

        assert!(chunk
            .expire_requests(start + Duration::from_secs(1), Duration::from_secs(5))
            .is_empty());
        let expired = chunk.expire_requests(start + Duration::from_secs(6), Duration::from_secs(5));
        assert_eq!(expired, vec![RemoteId(7)]);
        assert_eq!(chunk.timeouts[&RemoteId(7)], 1);
        assert_eq!(chunk.next_request_range(100), Some((0, 100)));
    }

    #[test]
    fn test_builder_writes_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let ct_hash = CtHash::from_bytes([2; 32]);
        let mut builder = ChunkFileBuilder::new(dir.path(), &ct_hash, 6);

        builder.put_block(3, b"def").unwrap().unwrap();
        assert!(!builder.complete());
        assert!(matches!(
            builder.put_block(4, b"xyz").unwrap(),
            Err(AvailabilityError::OutOfBounds { .. })
        ));
        assert!(matches!(
            builder.put_block(3, b"d").unwrap(),
            Err(AvailabilityError::Overlap { .. })
        ));
        builder.put_block(0, b"abc").unwrap().unwrap();
        assert!(builder.complete());
        assert_eq!(fs::read(builder.path()).unwrap(), b"abcdef");
        assert_eq!(builder.ct_hash().unwrap(), compute_ct_hash(b"abcdef"));

        let path = builder.path().to_path_buf();
        drop(builder);
        assert!(!path.exists());
    }

    #[test]
    fn test_discarded_assembly_blames_contributors() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = DownloadChunk::new(dir.path(), CtHash::from_bytes([3; 32]), 6);
        let now = Instant::now();
        chunk.add_request(RemoteId(9), 0, 6, now);
        chunk.builder.put_block(0, b"abc").unwrap().unwrap();
        chunk.contributors.insert(RemoteId(2));
        chunk.builder.put_block(3, b"def").unwrap().unwrap();
        chunk.contributors.insert(RemoteId(1));

        assert_eq!(chunk.discard_assembly(), vec![RemoteId(1), RemoteId(2)]);
        assert!(chunk.contributors.is_empty());
        assert_eq!(chunk.failures[&RemoteId(1)], 1);
        assert_eq!(chunk.failures[&RemoteId(2)], 1);
        assert!(!chunk.failures.contains_key(&RemoteId(9)));
        assert!(!chunk.builder.complete());
        assert_eq!(chunk.builder.map().size_left(), 6);
        assert_eq!(chunk.requests_to(RemoteId(9)), 1);

        chunk.forget_remote(RemoteId(1));
        assert!(!chunk.failures.contains_key(&RemoteId(1)));
    }
}
