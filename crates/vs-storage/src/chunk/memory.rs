//! Bounded in-memory chunk cache, least-recently-used eviction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use vs_core::CtHash;

struct Entry {
    data: Arc<[u8]>,
    tick: u64,
}

#[derive(Default)]
struct Lru {
    entries: HashMap<CtHash, Entry>,
    /// access tick -> key, oldest first
    order: BTreeMap<u64, CtHash>,
    clock: u64,
}

impl Lru {
    fn touch(&mut self, ct_hash: &CtHash) -> Option<Arc<[u8]>> {
        self.clock += 1;
        let entry = self.entries.get_mut(ct_hash)?;
        self.order.remove(&entry.tick);
        entry.tick = self.clock;
        self.order.insert(self.clock, *ct_hash);
        Some(entry.data.clone())
    }
}

pub struct MemoryStorage {
    capacity: usize,
    inner: Mutex<Lru>,
}

impl MemoryStorage {
    /// A zero capacity disables the tier.
    pub fn new(capacity: usize) -> Self {
        MemoryStorage {
            capacity,
            inner: Mutex::new(Lru::default()),
        }
    }

    pub fn have(&self, ct_hash: &CtHash) -> bool {
        self.inner.lock().entries.contains_key(ct_hash)
    }

    pub fn get(&self, ct_hash: &CtHash) -> Option<Arc<[u8]>> {
        self.inner.lock().touch(ct_hash)
    }

    pub fn put(&self, ct_hash: CtHash, data: Arc<[u8]>) {
        if self.capacity == 0 {
            return;
        }
        let mut lru = self.inner.lock();
        if lru.touch(&ct_hash).is_some() {
            return;
        }
        while lru.entries.len() >= self.capacity {
            let Some((_, oldest)) = lru.order.pop_first() else {
                break;
            };
            lru.entries.remove(&oldest);
        }
        lru.clock += 1;
        let tick = lru.clock;
        lru.order.insert(tick, ct_hash);
        lru.entries.insert(ct_hash, Entry { data, tick });
    }

    pub fn remove(&self, ct_hash: &CtHash) {
        let mut lru = self.inner.lock();
        if let Some(entry) = lru.entries.remove(ct_hash) {
            lru.order.remove(&entry.tick);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> CtHash {
        CtHash::from_bytes([b; 32])
    }

    fn data(b: u8) -> Arc<[u8]> {
        Arc::from(vec![b; 4])
    }

    #[test]
    fn test_put_get() {
        let mem = MemoryStorage::new(4);
        mem.put(h(1), data(1));
        assert!(mem.have(&h(1)));
        assert_eq!(&*mem.get(&h(1)).unwrap(), &[1, 1, 1, 1]);
        assert!(mem.get(&h(2)).is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mem = MemoryStorage::new(2);
        mem.put(h(1), data(1));
        mem.put(h(2), data(2));
        mem.get(&h(1)); // 2 is now oldest
        mem.put(h(3), data(3));

        assert!(mem.have(&h(1)));
        assert!(!mem.have(&h(2)));
        assert!(mem.have(&h(3)));
        assert_eq!(mem.len(), 2);
    }

    #[test]
    fn test_remove_and_zero_capacity() {
        let mem = MemoryStorage::new(2);
        mem.put(h(1), data(1));
        mem.remove(&h(1));
        assert!(mem.is_empty());

        let off = MemoryStorage::new(0);
        off.put(h(1), data(1));
        assert!(!off.have(&h(1)));
    }
}
