//! # rttp-cache
//!
//! A transparent HTTP response cache. It sits between a caller and a
//! [`Transport`], replays stored responses while they are usable and otherwise
//! spends the cheapest round trip that settles freshness: a conditional
//! request when the stored response carries a validator, a full fetch when it
//! does not.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rttp_cache::{CacheEngine, CacheSettings, CacheStore, Request, Response};
//! use rttp_cache::error::TransportError;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = CacheSettings::from_toml_str(r#"
//!         expire_after = 300
//!         cache_control = true
//!         stale_if_error = 600
//!     "#)?;
//!     let transport = |req: Request| async move {
//!         // Hand the request to a real HTTP client here.
//!         Ok::<_, TransportError>(Response::new(200).with_url(req.url().to_owned()))
//!     };
//!     let engine = CacheEngine::new(transport, CacheStore::in_memory(), settings)?;
//!     let response = engine.send(Request::get("https://example.com/")).await?;
//!     println!("from cache: {}", response.from_cache());
//!     Ok(())
//! }
//! ```

// ── Value types ───────────────────────────────────────────────────────────────
pub mod error;
pub mod http;
pub mod settings;

// ── Cache core ────────────────────────────────────────────────────────────────
pub mod backend;
pub mod cache;
pub mod key;
pub mod policy;
pub mod serializer;

// ── Orchestration ─────────────────────────────────────────────────────────────
pub mod background;
pub mod engine;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheStore, CachedResponse, ExpiredFilter};
pub use engine::{CacheEngine, Transport};
pub use error::{CacheError, CacheResult};
pub use http::{Headers, Method, Request, Response};
pub use key::{CacheKey, KeyGenerator};
pub use settings::{CacheSettings, ExpireAfter, RequestOptions, StaleSetting};
