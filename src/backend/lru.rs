//! Size accounting and least-recently-used eviction.

use std::collections::HashMap;

use super::{BackendError, BackendResult};

/// Entries are charged in whole blocks, the way a filesystem allocates them.
const BLOCK_SIZE: u64 = 4096;

fn charged(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE).max(1) * BLOCK_SIZE
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    size: u64,
    tick: u64,
}

/// Tracks per-key sizes and access order for a bounded table.
///
/// The index does not own data. Callers record accesses and writes, and delete
/// whatever [`record_write`](Self::record_write) returns as evicted.
#[derive(Debug, Default)]
pub struct LruIndex {
    slots: HashMap<String, Slot>,
    total: u64,
    clock: u64,
    max_total: Option<u64>,
    max_entry: Option<u64>,
}

impl LruIndex {
    pub fn new(max_total: Option<u64>, max_entry: Option<u64>) -> Self {
        Self {
            max_total,
            max_entry,
            ..Self::default()
        }
    }

    /// Total charged bytes.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fails if an entry of `len` bytes may never be stored.
    pub fn check_entry(&self, len: u64) -> BackendResult<()> {
        match self.max_entry {
            Some(max) if len > max => Err(BackendError::EntryTooLarge { size: len, max }),
            _ => Ok(()),
        }
    }

    pub fn touch(&mut self, key: &str) {
        self.clock += 1;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.tick = self.clock;
        }
    }

    /// Records a write and returns the keys to evict, oldest first.
    ///
    /// The key just written is the newest, so it is evicted only when it
    /// alone exceeds the bound.
    pub fn record_write(&mut self, key: &str, len: u64) -> Vec<String> {
        self.clock += 1;
        let size = charged(len);
        let previous = self.slots.insert(
            key.to_owned(),
            Slot {
                size,
                tick: self.clock,
            },
        );
        self.total = self.total - previous.map_or(0, |s| s.size) + size;
        self.evict()
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(slot) = self.slots.remove(key) {
            self.total -= slot.size;
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.total = 0;
    }

    fn evict(&mut self) -> Vec<String> {
        let Some(max) = self.max_total else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while self.total > max {
            let Some(oldest) = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.tick)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_blocks() {
        assert_eq!(charged(0), BLOCK_SIZE);
        assert_eq!(charged(1), BLOCK_SIZE);
        assert_eq!(charged(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut lru = LruIndex::new(Some(2 * BLOCK_SIZE), None);
        assert!(lru.record_write("a", 10).is_empty());
        assert!(lru.record_write("b", 10).is_empty());
        lru.touch("a");
        assert_eq!(lru.record_write("c", 10), vec!["b".to_owned()]);
        assert_eq!(lru.total(), 2 * BLOCK_SIZE);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn overwrite_replaces_size() {
        let mut lru = LruIndex::new(None, None);
        lru.record_write("a", 3 * BLOCK_SIZE);
        lru.record_write("a", 1);
        assert_eq!(lru.total(), BLOCK_SIZE);
        lru.remove("a");
        assert_eq!(lru.total(), 0);
        assert!(lru.is_empty());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let lru = LruIndex::new(None, Some(100));
        assert!(lru.check_entry(100).is_ok());
        assert!(matches!(
            lru.check_entry(101),
            Err(BackendError::EntryTooLarge { size: 101, max: 100 })
        ));
    }
}
