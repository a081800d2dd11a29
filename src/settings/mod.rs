//! Cache behavior settings and per-request overrides.
//!
//! Settings can be built in code or loaded from TOML/JSON:
//!
//! ```toml
//! expire_after = 300
//! cache_control = true
//! stale_if_error = 3600
//! match_headers = ["Accept"]
//!
//! [[urls_expire_after]]
//! pattern = "*.example.com/static"
//! expire_after = "never"
//!
//! [[urls_expire_after]]
//! pattern = "*"
//! expire_after = "do_not_cache"
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::http::{Method, Response};
use crate::key::{DEFAULT_IGNORED_PARAMETERS, KeyGenerator, MatchHeaders};

mod expiration;

pub use expiration::{ExpireAfter, StaleSetting, UrlExpiration};

/// A caller-supplied predicate deciding whether a response may be stored.
#[derive(Clone)]
pub struct ResponseFilter(Arc<dyn Fn(&Response) -> bool + Send + Sync>);

impl ResponseFilter {
    pub fn new(predicate: impl Fn(&Response) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn allows(&self, response: &Response) -> bool {
        (self.0)(response)
    }
}

impl fmt::Debug for ResponseFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseFilter(..)")
    }
}

/// Session-wide cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Default freshness lifetime.
    pub expire_after: ExpireAfter,
    /// Ordered URL-pattern table; the first matching row wins.
    pub urls_expire_after: Vec<UrlExpiration>,
    /// Query params, body keys and headers excluded from keys and storage.
    pub ignored_parameters: Vec<String>,
    pub match_headers: MatchHeaders,
    /// Honor response `Cache-Control`/`Expires` headers.
    pub cache_control: bool,
    pub stale_if_error: StaleSetting,
    pub stale_while_revalidate: StaleSetting,
    /// Revalidate every hit that carries a validator, even when fresh.
    pub always_revalidate: bool,
    pub allowable_methods: Vec<Method>,
    pub allowable_codes: Vec<u16>,
    /// Never contact the network; unmatched lookups get a 504.
    pub only_if_cached: bool,
    /// Read from the cache but never write to it.
    pub read_only: bool,
    /// Bypass the cache entirely.
    pub disabled: bool,
    #[serde(skip)]
    pub filter: Option<ResponseFilter>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            expire_after: ExpireAfter::NeverExpire,
            urls_expire_after: Vec::new(),
            ignored_parameters: DEFAULT_IGNORED_PARAMETERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            match_headers: MatchHeaders::None,
            cache_control: false,
            stale_if_error: StaleSetting::Disabled,
            stale_while_revalidate: StaleSetting::Disabled,
            always_revalidate: false,
            allowable_methods: vec![Method::Get, Method::Head],
            allowable_codes: vec![200],
            only_if_cached: false,
            read_only: false,
            disabled: false,
            filter: None,
        }
    }
}

impl CacheSettings {
    pub fn from_toml_str(raw: &str) -> CacheResult<Self> {
        let settings: Self = toml::from_str(raw).map_err(|e| CacheError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_str(raw: &str) -> CacheResult<Self> {
        let settings: Self =
            serde_json::from_str(raw).map_err(|e| CacheError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects URL patterns that do not compile.
    pub fn validate(&self) -> CacheResult<()> {
        for row in &self.urls_expire_after {
            row.compile().map_err(|e| {
                CacheError::Settings(format!("invalid URL pattern `{}`: {e}", row.pattern))
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn with_filter(
        mut self,
        predicate: impl Fn(&Response) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(ResponseFilter::new(predicate));
        self
    }

    /// The expiration of the first `urls_expire_after` row matching `url`.
    pub fn url_expiration(&self, url: &str) -> Option<ExpireAfter> {
        self.urls_expire_after
            .iter()
            .find(|row| row.matches(url))
            .map(|row| row.expire_after.clone())
    }

    pub fn key_generator(&self) -> KeyGenerator {
        KeyGenerator::new(self.ignored_parameters.clone(), self.match_headers.clone())
    }

    /// Status code and filter checks applied before any write.
    pub fn is_cacheable(&self, response: &Response) -> bool {
        self.allowable_codes.contains(&response.status())
            && self.filter.as_ref().is_none_or(|f| f.allows(response))
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides URL-pattern and session expiration for this request.
    pub expire_after: Option<ExpireAfter>,
    /// Serve only from cache; 504 if nothing usable is stored.
    pub only_if_cached: bool,
    /// Revalidate the cached response before using it.
    pub refresh: bool,
    /// Skip the cache read and fetch, still storing the result.
    pub force_refresh: bool,
}

impl RequestOptions {
    pub fn expire_after(expire_after: ExpireAfter) -> Self {
        Self {
            expire_after: Some(expire_after),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults() {
        let s = CacheSettings::default();
        assert_eq!(s.expire_after, ExpireAfter::NeverExpire);
        assert_eq!(s.allowable_codes, vec![200]);
        assert!(s.ignored_parameters.iter().any(|p| p == "Authorization"));
        assert!(!s.cache_control);
    }

    #[test]
    fn loads_toml() {
        let s = CacheSettings::from_toml_str(
            r#"
            expire_after = 300
            cache_control = true
            stale_if_error = 60
            stale_while_revalidate = true
            match_headers = ["Accept"]
            allowable_methods = ["GET", "post"]

            [[urls_expire_after]]
            pattern = "*.a.com"
            expire_after = 30

            [[urls_expire_after]]
            pattern = "*"
            expire_after = "do_not_cache"
            "#,
        )
        .unwrap();
        assert_eq!(s.expire_after, ExpireAfter::Duration(Duration::from_secs(300)));
        assert!(s.cache_control);
        assert_eq!(s.stale_if_error, StaleSetting::Within(Duration::from_secs(60)));
        assert_eq!(s.stale_while_revalidate, StaleSetting::Unbounded);
        assert_eq!(s.match_headers, MatchHeaders::List(vec!["Accept".into()]));
        assert_eq!(s.allowable_methods, vec![Method::Get, Method::Post]);
        assert_eq!(s.urls_expire_after.len(), 2);
        // Unspecified fields keep their defaults.
        assert_eq!(s.allowable_codes, vec![200]);
    }

    #[test]
    fn glob_table_first_match_wins() {
        let s = CacheSettings {
            urls_expire_after: vec![
                UrlExpiration::new("*.a.com", ExpireAfter::from_seconds(30)),
                UrlExpiration::new("*", ExpireAfter::DoNotCache),
            ],
            ..CacheSettings::default()
        };
        assert_eq!(
            s.url_expiration("https://x.a.com/page"),
            Some(ExpireAfter::from_seconds(30))
        );
        assert_eq!(s.url_expiration("https://y.com/"), Some(ExpireAfter::DoNotCache));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = CacheSettings::from_json_str(
            r#"{"urls_expire_after": [{"pattern": "[a-", "expire_after": 10}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::Settings(_)));
    }

    #[test]
    fn filter_and_codes_gate_writes() {
        let s = CacheSettings::default().with_filter(|r| !r.headers().contains("x-private"));
        assert!(s.is_cacheable(&Response::new(200)));
        assert!(!s.is_cacheable(&Response::new(404)));
        assert!(!s.is_cacheable(&Response::new(200).header("X-Private", "1")));
    }
}
