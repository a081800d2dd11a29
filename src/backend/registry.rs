//! Backend lookup by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    BackendOptions, BackendResult, FileSystemBackend, MemoryBackend, StorageBackend,
};

/// Builds the backend for one table (`responses` or `redirects`).
pub type BackendFactory =
    Arc<dyn Fn(&BackendOptions, &str) -> BackendResult<Arc<dyn StorageBackend>> + Send + Sync>;

/// Named backend constructors. `memory` and `filesystem` are always present.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// A registry with no backends at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&BackendOptions, &str) -> BackendResult<Arc<dyn StorageBackend>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the `table` backend registered as `name`, or `None` if unknown.
    pub fn create(
        &self,
        name: &str,
        options: &BackendOptions,
        table: &str,
    ) -> Option<BackendResult<Arc<dyn StorageBackend>>> {
        self.factories
            .get(name)
            .map(|factory| factory(options, table))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register("memory", |options, table| {
                Ok(Arc::new(MemoryBackend::with_options(table, options)) as Arc<dyn StorageBackend>)
            })
            .register("filesystem", |options, table| {
                let backend =
                    FileSystemBackend::open(options.cache_dir().join(table), table, options)?;
                Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
            });
        registry
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish()
    }
}
