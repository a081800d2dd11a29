//! Request normalization and cache-key derivation.
//!
//! A cache key is a SHA-256 digest over a canonical form of the request:
//!
//! 1. method, upper-cased;
//! 2. URL with lower-cased scheme/host, the fragment dropped and the query
//!    (plus any extra params) filtered and sorted by `(name, value)`;
//! 3. body, canonicalized for JSON and form content, raw bytes otherwise;
//! 4. the header subset selected by [`MatchHeaders`].
//!
//! Ignored parameters are stripped from the query, the body and the headers
//! before hashing, and the same stripped [`RequestSnapshot`] is what gets
//! persisted, so credentials listed there never reach storage.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::cache::CachedResponse;
use crate::http::{Headers, Method, Request};

/// Parameters, body keys and headers stripped by default: common credentials.
pub const DEFAULT_IGNORED_PARAMETERS: &[&str] =
    &["Authorization", "X-API-KEY", "access_token", "api_key"];

/// Opaque, fixed-length identifier of an equivalence class of requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps a key read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which request headers take part in the key.
///
/// Deserializes from `false`/`true` or a list of header names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MatchHeadersRepr", into = "MatchHeadersRepr")]
pub enum MatchHeaders {
    #[default]
    None,
    All,
    List(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MatchHeadersRepr {
    Flag(bool),
    List(Vec<String>),
}

impl From<MatchHeadersRepr> for MatchHeaders {
    fn from(repr: MatchHeadersRepr) -> Self {
        match repr {
            MatchHeadersRepr::Flag(true) => Self::All,
            MatchHeadersRepr::Flag(false) => Self::None,
            MatchHeadersRepr::List(names) => Self::List(names),
        }
    }
}

impl From<MatchHeaders> for MatchHeadersRepr {
    fn from(policy: MatchHeaders) -> Self {
        match policy {
            MatchHeaders::None => Self::Flag(false),
            MatchHeaders::All => Self::Flag(true),
            MatchHeaders::List(names) => Self::List(names),
        }
    }
}

/// Failure to canonicalize part of a request. Never fatal: the affected part
/// falls back to its raw form.
#[derive(Debug, Error)]
pub enum KeyDerivationError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("form body is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// The canonical, persisted form of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: Method,
    pub url: String,
    #[serde(with = "crate::serializer::base64_bytes", default)]
    pub body: Vec<u8>,
    /// Lower-cased, sorted, with ignored names removed.
    pub headers: Vec<(String, String)>,
}

impl RequestSnapshot {
    /// Rebuilds a request equivalent to the one this snapshot was taken from.
    pub fn to_request(&self) -> Request {
        let mut request =
            Request::new(self.method.clone(), self.url.clone()).body(self.body.clone());
        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        request
    }
}

/// Derives [`CacheKey`]s from requests under one ignore/match policy.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::Request;
/// use rttp_cache::key::{KeyGenerator, MatchHeaders};
///
/// let keys = KeyGenerator::new(vec!["api_key".into()], MatchHeaders::None);
/// let a = keys.create_key(&Request::get("https://Example.com/items?b=2&a=1&api_key=s1"));
/// let b = keys.create_key(&Request::get("https://example.com/items?a=1&b=2&api_key=s2"));
/// assert_eq!(a, b);
/// assert_eq!(a.as_str().len(), 64);
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator {
    ignored: Vec<String>,
    match_headers: MatchHeaders,
}

impl KeyGenerator {
    /// `ignored` names are dropped from query params, JSON/form bodies and
    /// (case-insensitively) headers before hashing.
    pub fn new(ignored: Vec<String>, match_headers: MatchHeaders) -> Self {
        Self {
            ignored,
            match_headers,
        }
    }

    pub fn match_headers(&self) -> &MatchHeaders {
        &self.match_headers
    }

    /// Computes the key for a live request.
    pub fn create_key(&self, request: &Request) -> CacheKey {
        self.key_for_snapshot(&self.normalize(request))
    }

    /// Computes the key for an already-normalized request.
    pub fn key_for_snapshot(&self, snapshot: &RequestSnapshot) -> CacheKey {
        digest(snapshot, &self.match_headers)
    }

    /// Canonicalizes a request, stripping ignored parameters everywhere.
    pub fn normalize(&self, request: &Request) -> RequestSnapshot {
        RequestSnapshot {
            method: request.method().clone(),
            url: self.normalize_url(request.url(), request.params()),
            body: self.normalize_body(request.headers(), request.body_bytes()),
            headers: self.normalize_headers(request.headers()),
        }
    }

    /// Checks a cached response's `Vary` headers against a new request.
    ///
    /// Returns `true` when the response carries no `Vary`, or when every
    /// header it names has the same value in both requests. `Vary: *` never
    /// matches.
    pub fn vary_matches(&self, request: &Request, cached: &CachedResponse) -> bool {
        let names: Vec<String> = cached
            .headers
            .get_all("vary")
            .flat_map(|v| v.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            return true;
        }
        if names.iter().any(|name| name == "*") {
            return false;
        }
        let policy = MatchHeaders::List(names);
        digest(&self.normalize(request), &policy) == digest(&cached.request, &policy)
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|ignored| ignored == name)
    }

    fn is_ignored_header(&self, name: &str) -> bool {
        self.ignored
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(name))
    }

    fn normalize_url(&self, raw: &str, extra: &[(String, String)]) -> String {
        match self.canonical_url(raw, extra) {
            Ok(url) => url,
            Err(e) => {
                debug!(url = raw, error = %e, "using raw URL for cache key");
                self.raw_url(raw, extra)
            }
        }
    }

    fn canonical_url(
        &self,
        raw: &str,
        extra: &[(String, String)],
    ) -> Result<String, KeyDerivationError> {
        // `Url::parse` lower-cases the scheme and host.
        let mut url = Url::parse(raw.trim())?;
        let pairs = self.query_pairs(url.query().unwrap_or_default(), extra);

        url.set_fragment(None);
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.extend_pairs(pairs.iter());
        }
        Ok(url.to_string())
    }

    /// Unparseable URLs (relative ones, mostly) keep their path as written
    /// but still get a canonical query.
    fn raw_url(&self, raw: &str, extra: &[(String, String)]) -> String {
        let raw = raw.trim();
        let without_fragment = raw.split_once('#').map_or(raw, |(head, _)| head);
        let (path, query) = without_fragment
            .split_once('?')
            .unwrap_or((without_fragment, ""));
        let pairs = self.query_pairs(query, extra);
        if pairs.is_empty() {
            return path.to_owned();
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        format!("{path}?{query}")
    }

    /// Existing query plus extra params, ignored names removed, sorted.
    fn query_pairs(&self, query: &str, extra: &[(String, String)]) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .chain(extra.iter().cloned())
            .filter(|(name, _)| !self.is_ignored(name))
            .collect();
        pairs.sort();
        pairs
    }

    fn normalize_body(&self, headers: &Headers, body: &[u8]) -> Vec<u8> {
        if body.is_empty() {
            return Vec::new();
        }
        let content_type = headers
            .get("content-type")
            .unwrap_or_default()
            .to_ascii_lowercase();
        let canonical = if content_type.contains("json") {
            self.canonical_json(body)
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            self.canonical_form(body)
        } else {
            return body.to_vec();
        };
        canonical.unwrap_or_else(|e| {
            debug!(error = %e, "using raw body for cache key");
            body.to_vec()
        })
    }

    fn canonical_json(&self, body: &[u8]) -> Result<Vec<u8>, KeyDerivationError> {
        let mut value: Value = serde_json::from_slice(body)?;
        if let Value::Object(map) = &mut value {
            map.retain(|name, _| !self.is_ignored(name));
        }
        Ok(serde_json::to_vec(&sorted(value))?)
    }

    fn canonical_form(&self, body: &[u8]) -> Result<Vec<u8>, KeyDerivationError> {
        let text = std::str::from_utf8(body)?;
        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(text.as_bytes())
            .into_owned()
            .filter(|(name, _)| !self.is_ignored(name))
            .collect();
        pairs.sort();
        Ok(url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish()
            .into_bytes())
    }

    fn normalize_headers(&self, headers: &Headers) -> Vec<(String, String)> {
        headers
            .canonical()
            .into_iter()
            .filter(|(name, _)| !self.is_ignored_header(name))
            .collect()
    }
}

/// Rebuilds every JSON object with keys in sorted order, whatever map
/// implementation serde_json was compiled with.
fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

fn digest(snapshot: &RequestSnapshot, match_headers: &MatchHeaders) -> CacheKey {
    let mut hasher = Sha256::new();
    // Length-prefixed fields: "a" + "bc" and "ab" + "c" must not collide.
    update_field(&mut hasher, snapshot.method.as_str().as_bytes());
    update_field(&mut hasher, snapshot.url.as_bytes());
    update_field(&mut hasher, &snapshot.body);

    let selected = snapshot.headers.iter().filter(|(name, _)| match match_headers {
        MatchHeaders::None => false,
        MatchHeaders::All => true,
        MatchHeaders::List(names) => names.iter().any(|n| n.eq_ignore_ascii_case(name)),
    });
    for (name, value) in selected {
        update_field(&mut hasher, name.as_bytes());
        update_field(&mut hasher, value.as_bytes());
    }
    CacheKey(hex::encode(hasher.finalize()))
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
