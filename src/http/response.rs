//! Responses returned to callers, fresh from the network or replayed from cache.

use std::io::{self, Read};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::Headers;
use crate::key::CacheKey;

/// A fully buffered response body with a read cursor.
///
/// Reading advances the cursor; [`rewind`](Self::rewind) restarts it, so the
/// same body can be consumed by the caller and still be stored or replayed
/// afterwards.
///
/// # Examples
///
/// ```
/// use std::io::Read;
/// use rttp_cache::http::ResponseBody;
///
/// let mut body = ResponseBody::from("hello");
/// let mut first = String::new();
/// body.read_to_string(&mut first).unwrap();
/// assert_eq!(first, "hello");
/// assert_eq!(body.remaining(), 0);
///
/// body.rewind();
/// let mut second = String::new();
/// body.read_to_string(&mut second).unwrap();
/// assert_eq!(second, "hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResponseBody {
    data: Bytes,
    cursor: usize,
}

impl ResponseBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            cursor: 0,
        }
    }

    /// The complete body regardless of cursor position.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// The complete body as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes not yet consumed through [`Read`].
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.data[self.cursor..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.cursor += n;
        Ok(n)
    }
}

impl PartialEq for ResponseBody {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl From<Bytes> for ResponseBody {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<String> for ResponseBody {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for ResponseBody {
    fn from(data: &'static str) -> Self {
        Self::new(data)
    }
}

/// Where a response came from and how fresh it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStatus {
    pub from_cache: bool,
    pub is_expired: bool,
    pub revalidated: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub cache_key: Option<CacheKey>,
}

/// An HTTP response as seen by the caller.
///
/// Transports build one with the fluent setters; the engine fills in the
/// [`CacheStatus`] before handing it back.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::Response;
///
/// let response = Response::new(200)
///     .header("ETag", "\"v1\"")
///     .with_body("payload")
///     .with_url("https://example.com/data");
///
/// assert_eq!(response.status(), 200);
/// assert_eq!(response.body().text().unwrap(), "payload");
/// assert!(!response.from_cache());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    url: String,
    headers: Headers,
    body: ResponseBody,
    history: Vec<String>,
    cache: CacheStatus,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            url: String::new(),
            headers: Headers::new(),
            body: ResponseBody::default(),
            history: Vec::new(),
            cache: CacheStatus::default(),
        }
    }

    /// The synthetic answer to a cache-only lookup that found nothing usable.
    pub fn not_satisfiable(url: impl Into<String>) -> Self {
        Self::new(504)
            .with_url(url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .with_body("Not cached: only-if-cached request could not be satisfied")
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<ResponseBody>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Records the intermediate URLs visited before this response, oldest first.
    #[must_use]
    pub fn with_history(mut self, urls: Vec<String>) -> Self {
        self.history = urls;
        self
    }

    #[must_use]
    pub fn with_cache_status(mut self, cache: CacheStatus) -> Self {
        self.cache = cache;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn cache(&self) -> &CacheStatus {
        &self.cache
    }

    pub fn from_cache(&self) -> bool {
        self.cache.from_cache
    }

    pub fn is_expired(&self) -> bool {
        self.cache.is_expired
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_reads_advance_cursor() {
        let mut body = ResponseBody::from("abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(body.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(body.remaining(), 2);
        assert_eq!(body.read(&mut buf).unwrap(), 2);
        assert_eq!(body.read(&mut buf).unwrap(), 0);
        body.rewind();
        assert_eq!(body.remaining(), 6);
    }

    #[test]
    fn body_equality_ignores_cursor() {
        let mut a = ResponseBody::from("xy");
        let b = ResponseBody::from("xy");
        let mut sink = Vec::new();
        a.read_to_end(&mut sink).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn not_satisfiable_is_504() {
        let r = Response::not_satisfiable("https://example.com/");
        assert_eq!(r.status(), 504);
        assert!(!r.from_cache());
        assert_eq!(r.url(), "https://example.com/");
    }
}
