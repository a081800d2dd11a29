//! In-process backend.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::{BackendOptions, BackendResult, LruIndex, StorageBackend};

#[derive(Debug)]
struct Stored {
    value: Vec<u8>,
    stored_at: Instant,
}

/// A `HashMap` behind a lock, with optional native TTL and size bound.
///
/// Lock order is map first, then LRU index.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    map: RwLock<HashMap<String, Stored>>,
    ttl: RwLock<Option<Duration>>,
    lru: Option<Mutex<LruIndex>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: RwLock::new(HashMap::new()),
            ttl: RwLock::new(None),
            lru: None,
        }
    }

    pub fn with_options(name: impl Into<String>, options: &BackendOptions) -> Self {
        Self {
            lru: options.lru_index().map(Mutex::new),
            ..Self::new(name)
        }
    }

    fn is_live(&self, stored: &Stored) -> bool {
        let ttl = *self.ttl.read();
        ttl.is_none_or(|ttl| stored.stored_at.elapsed() < ttl)
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let live = {
            let map = self.map.read();
            let Some(stored) = map.get(key) else {
                return Ok(None);
            };
            let value = self.is_live(stored).then(|| stored.value.clone());
            value
        };
        match live {
            Some(value) => {
                if let Some(lru) = &self.lru {
                    lru.lock().touch(key);
                }
                Ok(Some(value))
            }
            None => {
                // A writer may have replaced the expired value since the read
                // lock was dropped.
                let mut map = self.map.write();
                if map.get(key).is_some_and(|stored| !self.is_live(stored)) {
                    map.remove(key);
                    if let Some(lru) = &self.lru {
                        lru.lock().remove(key);
                    }
                }
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Vec<u8>) -> BackendResult<()> {
        let len = value.len() as u64;
        let mut map = self.map.write();
        if let Some(lru) = &self.lru {
            let mut lru = lru.lock();
            lru.check_entry(len)?;
            map.insert(
                key.to_owned(),
                Stored {
                    value,
                    stored_at: Instant::now(),
                },
            );
            for evicted in lru.record_write(key, len) {
                map.remove(&evicted);
                tracing::debug!(backend = %self.name, key = %evicted, "evicted entry");
            }
        } else {
            map.insert(
                key.to_owned(),
                Stored {
                    value,
                    stored_at: Instant::now(),
                },
            );
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut map = self.map.write();
        let existed = map.remove(key).is_some();
        if let Some(lru) = &self.lru {
            lru.lock().remove(key);
        }
        Ok(existed)
    }

    fn delete_if(&self, key: &str, expected: &[u8]) -> BackendResult<bool> {
        let mut map = self.map.write();
        if !map.get(key).is_some_and(|stored| stored.value == expected) {
            return Ok(false);
        }
        map.remove(key);
        if let Some(lru) = &self.lru {
            lru.lock().remove(key);
        }
        Ok(true)
    }

    fn keys(&self) -> BackendResult<Vec<String>> {
        Ok(self
            .map
            .read()
            .iter()
            .filter(|(_, stored)| self.is_live(stored))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn len(&self) -> BackendResult<usize> {
        Ok(self
            .map
            .read()
            .values()
            .filter(|stored| self.is_live(stored))
            .count())
    }

    fn clear(&self) -> BackendResult<()> {
        let mut map = self.map.write();
        map.clear();
        if let Some(lru) = &self.lru {
            lru.lock().clear();
        }
        Ok(())
    }

    fn set_ttl(&self, ttl: Duration) -> bool {
        *self.ttl.write() = Some(ttl);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;

    #[test]
    fn basic_operations() {
        let backend = MemoryBackend::new("responses");
        assert_eq!(backend.get("k").unwrap(), None);
        backend.set("k", b"v".to_vec()).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.keys().unwrap(), vec!["k".to_owned()]);
        assert!(backend.delete("k").unwrap());
        assert!(!backend.delete("k").unwrap());
    }

    #[test]
    fn native_ttl_hides_old_entries() {
        let backend = MemoryBackend::new("responses");
        assert!(backend.set_ttl(Duration::from_millis(20)));
        backend.set("k", b"v".to_vec()).unwrap();
        assert!(backend.get("k").unwrap().is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(backend.get("k").unwrap(), None);
        assert_eq!(backend.len().unwrap(), 0);
    }

    #[test]
    fn bounded_backend_evicts_and_rejects() {
        let options = BackendOptions {
            max_total_size: Some(2 * 4096),
            max_entry_size: Some(4096),
            ..BackendOptions::default()
        };
        let backend = MemoryBackend::with_options("responses", &options);
        backend.set("a", vec![0; 10]).unwrap();
        backend.set("b", vec![0; 10]).unwrap();
        backend.get("a").unwrap();
        backend.set("c", vec![0; 10]).unwrap();
        assert!(backend.contains("a").unwrap());
        assert!(!backend.contains("b").unwrap());

        let err = backend.set("big", vec![0; 5000]).unwrap_err();
        assert!(matches!(err, BackendError::EntryTooLarge { .. }));
    }

    #[test]
    fn delete_if_spares_a_newer_value() {
        let backend = MemoryBackend::new("responses");
        backend.set("k", b"old".to_vec()).unwrap();
        backend.set("k", b"new".to_vec()).unwrap();
        assert!(!backend.delete_if("k", b"old").unwrap());
        assert_eq!(backend.get("k").unwrap(), Some(b"new".to_vec()));
        assert!(backend.delete_if("k", b"new").unwrap());
        assert!(!backend.delete_if("k", b"new").unwrap());
    }

    #[test]
    fn rewritten_entry_outlives_its_expired_predecessor() {
        let backend = MemoryBackend::new("responses");
        backend.set_ttl(Duration::from_millis(20));
        backend.set("k", b"v1".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(backend.len().unwrap(), 0);
        backend.set("k", b"v2".to_vec()).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"v2".to_vec()));
    }
}
