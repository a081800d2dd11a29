//! Response storage: the `responses` and `redirects` tables over a backend.
//!
//! The store owns serialization, self-healing of corrupt entries and lazy
//! retention. Freshness decisions live in [`policy`](crate::policy); this
//! module only reports what is stored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::backend::{BackendOptions, BackendRegistry, MemoryBackend, StorageBackend};
use crate::error::{CacheError, CacheResult};
use crate::http::Request;
use crate::key::{CacheKey, KeyGenerator};
use crate::serializer::SerializerPipeline;
use crate::settings::ExpireAfter;

mod entry;

pub use entry::CachedResponse;

pub const RESPONSES_TABLE: &str = "responses";
pub const REDIRECTS_TABLE: &str = "redirects";

/// Selects entries by expiration when listing or counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpiredFilter {
    #[default]
    All,
    Expired,
    Valid,
}

impl ExpiredFilter {
    pub fn matches(self, entry: &CachedResponse, now: DateTime<Utc>) -> bool {
        match self {
            Self::All => true,
            Self::Expired => entry.is_expired_at(now),
            Self::Valid => !entry.is_expired_at(now),
        }
    }
}

/// Persistent cache of responses keyed by [`CacheKey`].
///
/// Cloning is cheap and clones share storage.
#[derive(Clone)]
pub struct CacheStore {
    responses: Arc<dyn StorageBackend>,
    redirects: Arc<dyn StorageBackend>,
    serializer: SerializerPipeline,
    retention: Option<Duration>,
    native_ttl: bool,
}

impl CacheStore {
    pub fn new(
        responses: Arc<dyn StorageBackend>,
        redirects: Arc<dyn StorageBackend>,
        serializer: SerializerPipeline,
    ) -> Self {
        Self {
            responses,
            redirects,
            serializer,
            retention: None,
            native_ttl: false,
        }
    }

    /// Unbounded in-memory tables with the plain JSON serializer.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new(RESPONSES_TABLE)),
            Arc::new(MemoryBackend::new(REDIRECTS_TABLE)),
            SerializerPipeline::json(),
        )
    }

    /// Builds both tables from the backend registered as `backend`.
    pub fn open(
        backend: &str,
        options: &BackendOptions,
        registry: &BackendRegistry,
        serializer: SerializerPipeline,
    ) -> CacheResult<Self> {
        let table = |name: &str| -> CacheResult<Arc<dyn StorageBackend>> {
            registry
                .create(backend, options, name)
                .ok_or_else(|| CacheError::UnknownBackend(backend.to_owned()))?
                .map_err(CacheError::from)
        };
        let store = Self::new(table(RESPONSES_TABLE)?, table(REDIRECTS_TABLE)?, serializer);
        debug!(
            backend,
            cache_name = %options.cache_name,
            serializer = store.serializer.name(),
            "opened cache store"
        );
        Ok(store)
    }

    /// Drops entries `retention` after they were stored, whatever their
    /// freshness. Uses the backend's native expiry when it has one and
    /// otherwise checks `created_at` on read.
    #[must_use]
    pub fn with_ttl(mut self, retention: Duration) -> Self {
        let responses = self.responses.set_ttl(retention);
        let redirects = self.redirects.set_ttl(retention);
        self.native_ttl = responses && redirects;
        self.retention = Some(retention);
        self
    }

    pub fn serializer(&self) -> &SerializerPipeline {
        &self.serializer
    }

    /// Looks up `key`, following the redirect index on a miss.
    pub fn get_response(&self, key: &CacheKey) -> CacheResult<Option<CachedResponse>> {
        let now = Utc::now();
        if let Some(entry) = self.load(key.as_str(), now)? {
            return Ok(Some(entry));
        }
        let Some(target) = self.redirect_target(key)? else {
            return Ok(None);
        };
        match self.load(&target, now)? {
            Some(entry) => {
                debug!(alias = %key, key = %target, "followed redirect");
                Ok(Some(entry))
            }
            None => {
                self.redirects.delete(key.as_str())?;
                Ok(None)
            }
        }
    }

    /// Stores `response` under `key`, replacing any previous entry.
    pub fn save_response(&self, response: &CachedResponse, key: &CacheKey) -> CacheResult<()> {
        let bytes = self.serializer.dumps(response)?;
        let size = bytes.len();
        self.responses.set(key.as_str(), bytes)?;
        debug!(key = %key, url = %response.url, size, "stored response");
        Ok(())
    }

    /// Makes lookups of `alias` resolve to the response stored under `target`.
    pub fn save_redirect(&self, alias: &CacheKey, target: &CacheKey) -> CacheResult<()> {
        if alias == target {
            return Ok(());
        }
        self.redirects
            .set(alias.as_str(), target.as_str().as_bytes().to_vec())?;
        Ok(())
    }

    /// Deletes responses and every redirect pointing at or named by them.
    /// Returns how many responses existed.
    pub fn delete(&self, keys: &[CacheKey]) -> CacheResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let raw: Vec<String> = keys.iter().map(|k| k.as_str().to_owned()).collect();
        let removed = self.responses.delete_many(&raw)?;
        self.purge_redirects(&raw.iter().map(String::as_str).collect())?;
        Ok(removed)
    }

    /// Deletes every expired entry.
    pub fn delete_expired(&self) -> CacheResult<usize> {
        let now = Utc::now();
        let expired: Vec<CacheKey> = self
            .entries(now)?
            .into_iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key)
            .collect();
        let removed = self.delete(&expired)?;
        info!(removed, "deleted expired responses");
        Ok(removed)
    }

    /// Deletes the responses cached for `requests`.
    pub fn delete_matching(&self, requests: &[Request], keys: &KeyGenerator) -> CacheResult<usize> {
        let targets: Vec<CacheKey> = requests.iter().map(|r| keys.create_key(r)).collect();
        self.delete(&targets)
    }

    /// Decodable, retained responses selected by `filter`.
    ///
    /// # Errors
    ///
    /// Surfaces [`CacheError::Integrity`] for tampered entries, after deleting them.
    pub fn responses(&self, filter: ExpiredFilter) -> CacheResult<Vec<CachedResponse>> {
        let now = Utc::now();
        Ok(self
            .entries(now)?
            .into_iter()
            .filter(|(_, entry)| filter.matches(entry, now))
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Keys of the `responses` table, redirect aliases excluded.
    pub fn keys(&self) -> CacheResult<Vec<CacheKey>> {
        Ok(self
            .responses
            .keys()?
            .into_iter()
            .map(CacheKey::from_raw)
            .collect())
    }

    /// Number of responses selected by `filter`.
    pub fn count(&self, filter: ExpiredFilter) -> CacheResult<usize> {
        match filter {
            ExpiredFilter::All if self.retention.is_none() => Ok(self.responses.len()?),
            _ => Ok(self.responses(filter)?.len()),
        }
    }

    /// Empties both tables.
    pub fn clear(&self) -> CacheResult<()> {
        self.responses.clear()?;
        self.redirects.clear()?;
        info!("cleared cache");
        Ok(())
    }

    /// Whether `key` names a stored response, directly or through a redirect.
    ///
    /// A redirect whose target is gone (evicted by a size bound, say) is
    /// removed and does not count.
    pub fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        if self.responses.contains(key.as_str())? {
            return Ok(true);
        }
        let Some(target) = self.redirect_target(key)? else {
            return Ok(false);
        };
        if self.responses.contains(&target)? {
            return Ok(true);
        }
        debug!(alias = %key, key = %target, "deleting dangling redirect");
        self.redirects.delete(key.as_str())?;
        Ok(false)
    }

    pub fn contains_request(&self, request: &Request, keys: &KeyGenerator) -> CacheResult<bool> {
        self.contains_key(&keys.create_key(request))
    }

    /// Recomputes every entry's expiration as if it had been stored now.
    pub fn reset_expiration(&self, expire_after: &ExpireAfter) -> CacheResult<usize> {
        let now = Utc::now();
        let entries = self.entries(now)?;
        let updated = entries.len();
        for (key, mut entry) in entries {
            entry.expires = expire_after.expires_at(now);
            self.save_response(&entry, &key)?;
        }
        info!(updated, ?expire_after, "reset expiration");
        Ok(updated)
    }

    /// Re-derives every key with `keys`, moving entries whose key changed.
    ///
    /// The new entry is written before the old one is deleted. Entries that
    /// cannot be decoded are dropped, redirects follow their moved target and
    /// dangling redirects are removed. Returns how many entries moved.
    pub fn recreate_keys(&self, keys: &KeyGenerator) -> CacheResult<usize> {
        let now = Utc::now();
        let mut renamed: HashMap<String, CacheKey> = HashMap::new();
        let mut dropped = 0usize;

        for old in self.responses.keys()? {
            let entry = match self.load(&old, now) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    dropped += 1;
                    continue;
                }
                Err(e) if e.is_integrity() => {
                    dropped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let new = keys.create_key(&entry.request.to_request());
            if new.as_str() == old {
                continue;
            }
            self.save_response(&entry, &new)?;
            self.responses.delete(&old)?;
            renamed.insert(old, new);
        }

        for alias in self.redirects.keys()? {
            let target = self
                .redirects
                .get(&alias)?
                .and_then(|target| String::from_utf8(target).ok());
            match target {
                Some(target) if renamed.contains_key(&target) => {
                    let alias = CacheKey::from_raw(alias);
                    self.save_redirect(&alias, &renamed[&target])?;
                }
                Some(target) if self.responses.contains(&target)? => {}
                _ => {
                    self.redirects.delete(&alias)?;
                }
            }
        }

        info!(moved = renamed.len(), dropped, "recreated cache keys");
        Ok(renamed.len())
    }

    /// The key `alias` redirects to. Unreadable redirects are deleted.
    fn redirect_target(&self, alias: &CacheKey) -> CacheResult<Option<String>> {
        let Some(raw) = self.redirects.get(alias.as_str())? else {
            return Ok(None);
        };
        match String::from_utf8(raw) {
            Ok(target) => Ok(Some(target)),
            Err(_) => {
                warn!(key = %alias, "deleting unreadable redirect");
                self.redirects.delete(alias.as_str())?;
                Ok(None)
            }
        }
    }

    /// Deletes redirects named by or pointing at any of `doomed`.
    fn purge_redirects(&self, doomed: &HashSet<&str>) -> CacheResult<()> {
        let mut aliases = Vec::new();
        for alias in self.redirects.keys()? {
            let points_at_doomed = self
                .redirects
                .get(&alias)?
                .and_then(|target| String::from_utf8(target).ok())
                .is_none_or(|target| doomed.contains(target.as_str()));
            if doomed.contains(alias.as_str()) || points_at_doomed {
                aliases.push(alias);
            }
        }
        self.redirects.delete_many(&aliases)?;
        Ok(())
    }

    /// Removes a bad entry unless a writer replaced it since it was read,
    /// taking its redirects along.
    fn discard(&self, key: &str, read: &[u8]) -> CacheResult<()> {
        if self.responses.delete_if(key, read)? {
            self.purge_redirects(&HashSet::from([key]))?;
        }
        Ok(())
    }

    /// Every decodable, retained entry with its key.
    fn entries(&self, now: DateTime<Utc>) -> CacheResult<Vec<(CacheKey, CachedResponse)>> {
        let mut entries = Vec::new();
        for key in self.responses.keys()? {
            if let Some(entry) = self.load(&key, now)? {
                entries.push((CacheKey::from_raw(key), entry));
            }
        }
        Ok(entries)
    }

    /// Reads and decodes one `responses` entry, deleting it when it is
    /// corrupt, tampered with or past retention.
    fn load(&self, key: &str, now: DateTime<Utc>) -> CacheResult<Option<CachedResponse>> {
        let Some(bytes) = self.responses.get(key)? else {
            return Ok(None);
        };
        let entry = match self.serializer.loads(&bytes) {
            Ok(entry) => entry,
            Err(e) if e.is_integrity() => {
                warn!(key, error = %e, "deleting tampered cache entry");
                self.discard(key, &bytes)?;
                return Err(e);
            }
            Err(e) => {
                warn!(key, error = %e, "deleting undecodable cache entry");
                self.discard(key, &bytes)?;
                return Ok(None);
            }
        };
        if self.past_retention(&entry, now) {
            debug!(key, "deleting entry past retention");
            self.discard(key, &bytes)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn past_retention(&self, entry: &CachedResponse, now: DateTime<Utc>) -> bool {
        if self.native_ttl {
            return false;
        }
        let Some(retention) = self.retention.and_then(|r| TimeDelta::from_std(r).ok()) else {
            return false;
        };
        entry
            .created_at
            .checked_add_signed(retention)
            .is_some_and(|dead_at| dead_at <= now)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("responses", &self.responses.name())
            .field("redirects", &self.redirects.name())
            .field("serializer", &self.serializer.name())
            .field("retention", &self.retention)
            .field("native_ttl", &self.native_ttl)
            .finish()
    }
}
