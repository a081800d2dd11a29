//! The stored form of a response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::http::response::CacheStatus;
use crate::http::{CacheDirectives, Headers, Response};
use crate::key::{CacheKey, RequestSnapshot};

/// Headers a `304 Not Modified` may refresh on the stored response.
const REVALIDATION_HEADERS: &[&str] = &[
    "cache-control",
    "expires",
    "etag",
    "last-modified",
    "date",
    "age",
    "vary",
];

/// A response as persisted in the `responses` map.
///
/// `expires` is absolute: once written it changes only through revalidation
/// or an explicit [`CacheStore::reset_expiration`](super::CacheStore::reset_expiration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub url: String,
    pub headers: Headers,
    #[serde(with = "crate::serializer::base64_bytes")]
    pub body: Vec<u8>,
    pub request: RequestSnapshot,
    pub created_at: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revalidated: bool,
}

impl CachedResponse {
    pub fn from_response(
        response: &Response,
        request: RequestSnapshot,
        expires: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let url = if response.url().is_empty() {
            request.url.clone()
        } else {
            response.url().to_owned()
        };
        Self {
            status: response.status(),
            url,
            headers: response.headers().clone(),
            body: response.body().bytes().to_vec(),
            request,
            created_at: now,
            expires,
            revalidated: false,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified")
    }

    pub fn has_validator(&self) -> bool {
        self.etag().is_some() || self.last_modified().is_some()
    }

    pub fn directives(&self) -> CacheDirectives {
        CacheDirectives::from_headers(&self.headers)
    }

    /// `If-None-Match` / `If-Modified-Since` headers for a conditional request.
    pub fn conditional_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some(etag) = self.etag() {
            headers.insert("If-None-Match", etag);
        }
        if let Some(modified) = self.last_modified() {
            headers.insert("If-Modified-Since", modified);
        }
        headers
    }

    /// Applies a `304 Not Modified`: new expiration, refreshed metadata headers.
    pub fn revalidate(&mut self, not_modified: &Response, expires: Option<DateTime<Utc>>) {
        for name in REVALIDATION_HEADERS {
            let values: Vec<String> = not_modified
                .headers()
                .get_all(name)
                .map(str::to_owned)
                .collect();
            if values.is_empty() {
                continue;
            }
            self.headers.remove(name);
            for value in values {
                self.headers.insert(*name, value);
            }
        }
        self.expires = expires;
        self.revalidated = true;
    }

    /// Replays this entry as a caller-facing response.
    pub fn to_response(&self, key: &CacheKey, now: DateTime<Utc>) -> Response {
        Response::new(self.status)
            .with_url(self.url.clone())
            .with_headers(self.headers.clone())
            .with_body(self.body.clone())
            .with_cache_status(CacheStatus {
                from_cache: true,
                is_expired: self.is_expired_at(now),
                revalidated: self.revalidated,
                created_at: Some(self.created_at),
                expires: self.expires,
                cache_key: Some(key.clone()),
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::http::Method;

    fn entry(headers: &[(&str, &str)], expires: Option<DateTime<Utc>>) -> CachedResponse {
        CachedResponse {
            status: 200,
            url: "https://example.com/".into(),
            headers: headers.iter().copied().collect(),
            body: b"body".to_vec(),
            request: RequestSnapshot {
                method: Method::Get,
                url: "https://example.com/".into(),
                body: Vec::new(),
                headers: Vec::new(),
            },
            created_at: Utc::now(),
            expires,
            revalidated: false,
        }
    }

    #[test]
    fn expiry_is_inclusive_of_the_boundary() {
        let now = Utc::now();
        let e = entry(&[], Some(now));
        assert!(e.is_expired_at(now));
        assert!(!e.is_expired_at(now - TimeDelta::milliseconds(1)));
        assert!(!entry(&[], None).is_expired_at(now));
    }

    #[test]
    fn conditional_headers_from_validators() {
        let e = entry(
            &[("ETag", "\"v1\""), ("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")],
            None,
        );
        let h = e.conditional_headers();
        assert_eq!(h.get("if-none-match"), Some("\"v1\""));
        assert_eq!(h.get("if-modified-since"), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert!(!entry(&[], None).has_validator());
    }

    #[test]
    fn revalidate_updates_expiration_and_validators() {
        let now = Utc::now();
        let mut e = entry(&[("ETag", "\"v1\""), ("Content-Type", "text/plain")], Some(now));
        let not_modified = Response::new(304).header("ETag", "\"v2\"");
        e.revalidate(&not_modified, Some(now + TimeDelta::seconds(60)));
        assert_eq!(e.etag(), Some("\"v2\""));
        assert_eq!(e.headers.get("content-type"), Some("text/plain"));
        assert!(e.revalidated);
        assert!(!e.is_expired_at(now));
        assert_eq!(e.body, b"body");
    }

    #[test]
    fn replay_marks_from_cache() {
        let now = Utc::now();
        let e = entry(&[], Some(now - TimeDelta::seconds(1)));
        let key = CacheKey::from_raw("k");
        let r = e.to_response(&key, now);
        assert!(r.from_cache());
        assert!(r.is_expired());
        assert_eq!(r.cache().cache_key.as_ref(), Some(&key));
        assert_eq!(r.body().bytes().as_ref(), b"body");
    }
}
