//! The request loop: key, lookup, decide, exchange, store.
//!
//! ```
//! use rttp_cache::engine::CacheEngine;
//! use rttp_cache::cache::CacheStore;
//! use rttp_cache::error::TransportError;
//! use rttp_cache::http::{Request, Response};
//! use rttp_cache::settings::CacheSettings;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = |_req: Request| async {
//!     Ok::<_, TransportError>(Response::new(200).with_body("hello"))
//! };
//! let engine = CacheEngine::new(transport, CacheStore::in_memory(), CacheSettings::default())?;
//!
//! let first = engine.send(Request::get("https://example.com/")).await?;
//! let second = engine.send(Request::get("https://example.com/")).await?;
//! assert!(!first.from_cache());
//! assert!(second.from_cache());
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, warn};

use crate::background::RefreshScheduler;
use crate::cache::{CacheStore, CachedResponse};
use crate::error::{CacheError, CacheResult, TransportError};
use crate::http::response::CacheStatus;
use crate::http::{Headers, Request, Response};
use crate::key::{CacheKey, KeyGenerator};
use crate::policy::{CacheActions, Decision, Refresh};
use crate::settings::{CacheSettings, RequestOptions};

/// Heap-allocated, `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sends a request over the network.
///
/// Any `Fn(Request) -> impl Future<Output = Result<Response, TransportError>>`
/// that is `Send + Sync + 'static` implements this trait through the blanket
/// impl below.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, TransportError>>;
}

impl<T, F> Transport for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
    fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, TransportError>> {
        Box::pin((self)(request))
    }
}

struct EngineInner {
    store: CacheStore,
    transport: Arc<dyn Transport>,
    settings: CacheSettings,
    keys: KeyGenerator,
    refresher: RefreshScheduler,
}

/// A caching client wrapped around a [`Transport`].
///
/// Clones share the store, settings and enabled flag.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
    enabled: Arc<AtomicBool>,
}

impl CacheEngine {
    /// # Errors
    ///
    /// Returns [`CacheError::Settings`] if a URL expiration pattern is invalid.
    pub fn new(
        transport: impl Transport,
        store: CacheStore,
        settings: CacheSettings,
    ) -> CacheResult<Self> {
        settings.validate()?;
        let keys = settings.key_generator();
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                transport: Arc::new(transport),
                settings,
                keys,
                refresher: RefreshScheduler::new(),
            }),
            enabled: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.inner.keys
    }

    pub fn cache_key(&self, request: &Request) -> CacheKey {
        self.inner.keys.create_key(request)
    }

    /// Number of background refreshes currently running.
    pub fn pending_refreshes(&self) -> usize {
        self.inner.refresher.pending()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Sends every request straight to the transport until [`enable`](Self::enable).
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub async fn send(&self, request: Request) -> CacheResult<Response> {
        self.send_with(request, RequestOptions::default()).await
    }

    /// Sends `request`, answering from the cache when the policy allows.
    ///
    /// # Errors
    ///
    /// Transport failures surface as [`CacheError::Transport`] unless a stale
    /// response may be served instead. Storage and integrity errors propagate.
    pub async fn send_with(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> CacheResult<Response> {
        if !self.is_enabled() {
            return self.fetch(request).await;
        }

        let inner = &self.inner;
        let now = Utc::now();
        let actions = CacheActions::from_request(&request, &inner.settings, &options, now);
        let key = inner.keys.create_key(&request);

        let cached = if actions.bypass {
            None
        } else {
            inner
                .store
                .get_response(&key)?
                .filter(|entry| {
                    let matches = inner.keys.vary_matches(&request, entry);
                    if !matches {
                        debug!(key = %key, "Vary mismatch; treating as miss");
                    }
                    matches
                })
        };

        let decision = actions.decide(cached.as_ref(), now);
        let state = actions.classify(&decision, cached.as_ref());
        debug!(key = %key, ?state, "cache lookup");

        match (decision, cached) {
            (Decision::Serve { stale, refresh }, Some(entry)) => {
                debug!(key = %key, stale, "cache hit");
                let response = entry.to_response(&key, now);
                if let Some(refresh) = refresh {
                    self.schedule_refresh(request, key, actions, entry, refresh);
                }
                Ok(response)
            }
            (Decision::Revalidate { headers, stale_on_error }, cached) => {
                debug!(key = %key, "revalidating");
                self.exchange(request, key, actions, cached, stale_on_error, Some(headers))
                    .await
            }
            (Decision::Fetch { stale_on_error }, cached) => {
                debug!(key = %key, cached = cached.is_some(), "fetching");
                self.exchange(request, key, actions, cached, stale_on_error, None)
                    .await
            }
            (Decision::Reject, _) => {
                debug!(key = %key, "cache-only request not satisfiable");
                Ok(Response::not_satisfiable(request.url()).with_cache_status(CacheStatus {
                    cache_key: Some(key),
                    ..CacheStatus::default()
                }))
            }
            (Decision::Bypass, _) | (Decision::Serve { .. }, None) => {
                debug!(key = %key, "bypassing cache");
                self.fetch(request).await
            }
        }
    }

    async fn fetch(&self, request: Request) -> CacheResult<Response> {
        self.inner
            .transport
            .send(request)
            .await
            .map_err(CacheError::Transport)
    }

    /// Sends `request` (conditionally when `conditional` is set) and reconciles
    /// the answer with the cache.
    async fn exchange(
        &self,
        request: Request,
        key: CacheKey,
        mut actions: CacheActions,
        cached: Option<CachedResponse>,
        stale_on_error: bool,
        conditional: Option<Headers>,
    ) -> CacheResult<Response> {
        let inner = &self.inner;
        let mut outbound = request.clone();
        if let Some(headers) = conditional {
            for (name, value) in headers.iter() {
                outbound.headers_mut().set(name, value);
            }
        }

        let result = inner.transport.send(outbound).await;
        let now = Utc::now();
        let response = match (result, cached) {
            (Err(e), Some(entry)) if stale_on_error => {
                warn!(key = %key, error = %e, "transport failed; serving stale response");
                return Ok(entry.to_response(&key, now));
            }
            (Err(e), _) => return Err(CacheError::Transport(e)),
            (Ok(response), Some(entry)) if response.status() >= 500 && stale_on_error => {
                warn!(
                    key = %key,
                    status = response.status(),
                    "server error; serving stale response"
                );
                return Ok(entry.to_response(&key, now));
            }
            (Ok(response), Some(mut entry)) if response.is_not_modified() => {
                actions.update_from_response(&response, now);
                entry.revalidate(&response, actions.expires);
                if !actions.skip_write {
                    inner.store.save_response(&entry, &key)?;
                }
                debug!(key = %key, expires = ?entry.expires, "revalidated");
                return Ok(entry.to_response(&key, now));
            }
            (Ok(response), _) => response,
        };

        actions.update_from_response(&response, now);
        let mut status = CacheStatus {
            cache_key: Some(key.clone()),
            ..CacheStatus::default()
        };
        if actions.should_store(&response, &inner.settings) {
            let entry = CachedResponse::from_response(
                &response,
                inner.keys.normalize(&request),
                actions.expires,
                now,
            );
            inner.store.save_response(&entry, &key)?;
            let hops = response
                .history()
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(response.url()))
                .filter(|url| !url.is_empty());
            for url in hops {
                let alias = inner.keys.create_key(&request.with_url(url));
                inner.store.save_redirect(&alias, &key)?;
            }
            status.created_at = Some(now);
            status.expires = actions.expires;
        } else {
            debug!(key = %key, status = response.status(), "response not stored");
        }
        Ok(response.with_cache_status(status))
    }

    fn schedule_refresh(
        &self,
        request: Request,
        key: CacheKey,
        actions: CacheActions,
        entry: CachedResponse,
        refresh: Refresh,
    ) {
        let conditional = match refresh {
            Refresh::Conditional(headers) => Some(headers),
            Refresh::Full => None,
        };
        let engine = self.clone();
        let task_key = key.clone();
        self.inner.refresher.schedule(key, async move {
            engine
                .exchange(request, task_key, actions, Some(entry), false, conditional)
                .await
                .map(|_| ())
        });
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("store", &self.inner.store)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_engine(settings: CacheSettings) -> (CacheEngine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transport = move |req: Request| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok::<_, TransportError>(
                    Response::new(200)
                        .with_url(req.url().to_owned())
                        .with_body(format!("call {n}")),
                )
            }
        };
        let engine = CacheEngine::new(transport, CacheStore::in_memory(), settings).unwrap();
        (engine, calls)
    }

    #[tokio::test]
    async fn disable_and_enable_at_runtime() {
        let (engine, calls) = counting_engine(CacheSettings::default());
        let req = Request::get("https://a.com/");
        engine.send(req.clone()).await.unwrap();

        engine.disable();
        let live = engine.send(req.clone()).await.unwrap();
        assert!(!live.from_cache());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        engine.enable();
        let hit = engine.send(req).await.unwrap();
        assert!(hit.from_cache());
        assert_eq!(hit.body().text().unwrap(), "call 0");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_overwrites_under_same_key() {
        let (engine, calls) = counting_engine(CacheSettings::default());
        let req = Request::get("https://a.com/");
        engine.send(req.clone()).await.unwrap();

        let options = RequestOptions {
            force_refresh: true,
            ..RequestOptions::default()
        };
        let refreshed = engine.send_with(req.clone(), options).await.unwrap();
        assert!(!refreshed.from_cache());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let hit = engine.send(req).await.unwrap();
        assert_eq!(hit.body().text().unwrap(), "call 1");
        assert_eq!(engine.store().keys().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redirect_history_is_aliased() {
        let transport = |_req: Request| async {
            Ok::<_, TransportError>(
                Response::new(200)
                    .with_url("https://a.com/final")
                    .with_history(vec!["https://a.com/start".into()])
                    .with_body("moved"),
            )
        };
        let engine = CacheEngine::new(
            transport,
            CacheStore::in_memory(),
            CacheSettings::default(),
        )
        .unwrap();
        engine.send(Request::get("https://a.com/start")).await.unwrap();

        let final_key = engine.cache_key(&Request::get("https://a.com/final"));
        let hit = engine.store().get_response(&final_key).unwrap().unwrap();
        assert_eq!(hit.body, b"moved");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = CacheSettings {
            urls_expire_after: vec![crate::settings::UrlExpiration::new(
                "[",
                crate::settings::ExpireAfter::NeverExpire,
            )],
            ..CacheSettings::default()
        };
        let transport = |_req: Request| async { Ok::<_, TransportError>(Response::new(200)) };
        assert!(matches!(
            CacheEngine::new(transport, CacheStore::in_memory(), settings),
            Err(CacheError::Settings(_))
        ));
    }
}
