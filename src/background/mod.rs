//! Background stale-while-revalidate refreshes.
//!
//! A refresh runs as a detached tokio task. At most one refresh per key is in
//! flight; a second request for the same key while one is running is dropped.
//! Failures are logged and swallowed since the caller has already been served.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::key::CacheKey;

/// Tracks and spawns background refreshes.
#[derive(Debug, Clone, Default)]
pub struct RefreshScheduler {
    in_flight: Arc<Mutex<HashSet<CacheKey>>>,
}

/// Releases the key when the task finishes, fails, panics or is cancelled.
struct InFlight {
    key: CacheKey,
    set: Arc<Mutex<HashSet<CacheKey>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().contains(key)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Spawns `refresh` for `key` on the current runtime.
    ///
    /// Returns `None` without running anything when a refresh for `key` is
    /// already in flight or when called outside a tokio runtime.
    pub fn schedule<F>(&self, key: CacheKey, refresh: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = CacheResult<()>> + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            debug!(key = %key, "no tokio runtime; skipping background refresh");
            return None;
        };
        if !self.in_flight.lock().insert(key.clone()) {
            debug!(key = %key, "refresh already in flight");
            return None;
        }
        let guard = InFlight {
            key,
            set: Arc::clone(&self.in_flight),
        };
        Some(handle.spawn(async move {
            let guard = guard;
            match refresh.await {
                Ok(()) => debug!(key = %guard.key, "background refresh complete"),
                Err(e) => warn!(key = %guard.key, error = %e, "background refresh failed"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::CacheError;

    #[test]
    fn outside_a_runtime_nothing_runs() {
        let scheduler = RefreshScheduler::new();
        let handle = scheduler.schedule(CacheKey::from_raw("k"), async { Ok(()) });
        assert!(handle.is_none());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn one_refresh_per_key() {
        let scheduler = RefreshScheduler::new();
        let key = CacheKey::from_raw("k");
        let (release, wait) = oneshot::channel::<()>();

        let first = scheduler
            .schedule(key.clone(), async move {
                let _ = wait.await;
                Ok(())
            })
            .unwrap();
        assert!(scheduler.is_pending(&key));
        assert!(scheduler.schedule(key.clone(), async { Ok(()) }).is_none());

        release.send(()).unwrap();
        first.await.unwrap();
        assert!(!scheduler.is_pending(&key));
        assert!(scheduler.schedule(key, async { Ok(()) }).is_some());
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_release_the_key() {
        let scheduler = RefreshScheduler::new();
        let key = CacheKey::from_raw("k");
        let handle = scheduler
            .schedule(key.clone(), async {
                Err(CacheError::Settings("boom".into()))
            })
            .unwrap();
        handle.await.unwrap();
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn aborted_refresh_releases_the_key() {
        let scheduler = RefreshScheduler::new();
        let key = CacheKey::from_raw("k");
        let handle = scheduler
            .schedule(key.clone(), std::future::pending::<CacheResult<()>>())
            .unwrap();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!scheduler.is_pending(&key));
    }
}
