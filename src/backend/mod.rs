//! Storage backends: byte-valued key/value tables.
//!
//! A cache store uses two tables from the same backend, `responses` and
//! `redirects`. Backends know nothing about responses; they move opaque bytes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod filesystem;
mod lru;
mod memory;
mod registry;

pub use filesystem::FileSystemBackend;
pub use lru::LruIndex;
pub use memory::MemoryBackend;
pub use registry::{BackendFactory, BackendRegistry};

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("entry of {size} bytes exceeds the maximum entry size of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },

    #[error("{0}")]
    Unavailable(String),
}

impl BackendError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// One key/value table.
pub trait StorageBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: Vec<u8>) -> BackendResult<()>;

    /// Returns `true` if the key existed.
    fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Deletes `key` only while it still holds `expected`, atomically with
    /// respect to `set`. Returns `true` if the entry was removed.
    fn delete_if(&self, key: &str, expected: &[u8]) -> BackendResult<bool>;

    fn keys(&self) -> BackendResult<Vec<String>>;

    fn len(&self) -> BackendResult<usize>;

    fn clear(&self) -> BackendResult<()>;

    /// Deletes every key, returning how many existed.
    fn delete_many(&self, keys: &[String]) -> BackendResult<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn contains(&self, key: &str) -> BackendResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn is_empty(&self) -> BackendResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Asks the backend to drop entries `ttl` after they are written.
    ///
    /// Returns `false` when the backend cannot expire entries on its own, in
    /// which case the store deletes them lazily on read.
    fn set_ttl(&self, _ttl: Duration) -> bool {
        false
    }
}

/// Options shared by every backend constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    /// Namespace for the store; the filesystem backend uses it as a directory name.
    pub cache_name: String,
    /// Parent directory for file-based backends. Defaults to the system temp dir.
    pub root: Option<PathBuf>,
    /// Evict least-recently-used entries once the table exceeds this many bytes.
    pub max_total_size: Option<u64>,
    /// Reject single entries larger than this many bytes.
    pub max_entry_size: Option<u64>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            cache_name: "http_cache".into(),
            root: None,
            max_total_size: None,
            max_entry_size: None,
        }
    }
}

impl BackendOptions {
    /// Directory holding this cache's tables.
    pub fn cache_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(&self.cache_name)
    }

    pub(crate) fn lru_index(&self) -> Option<LruIndex> {
        (self.max_total_size.is_some() || self.max_entry_size.is_some())
            .then(|| LruIndex::new(self.max_total_size, self.max_entry_size))
    }
}
