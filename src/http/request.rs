//! Outbound request description handed to the cache.

use bytes::Bytes;

use super::{Headers, Method};

/// A request the caller wants answered, either from the cache or the network.
///
/// `params` are extra query parameters merged into the URL's own query at
/// normalization time; keeping them separate mirrors how HTTP clients accept
/// them and lets the key generator strip ignored names before they ever reach
/// the URL.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::{Method, Request};
///
/// let request = Request::get("https://api.example.com/items?page=2")
///     .param("sort", "name")
///     .header("Accept", "application/json");
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.params(), &[("sort".to_string(), "name".to_string())]);
/// assert_eq!(request.headers().get("accept"), Some("application/json"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    url: String,
    params: Vec<(String, String)>,
    headers: Headers,
    body: Bytes,
}

impl Request {
    pub fn new(method: impl Into<Method>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            params: Vec::new(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Appends a query parameter. Duplicate names are kept.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Appends a request header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body from raw bytes.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and `Content-Type: application/json`.
    #[must_use]
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.headers.set("Content-Type", "application/json");
        self.body = Bytes::from(value.to_string());
        self
    }

    /// Sets a form body and `Content-Type: application/x-www-form-urlencoded`.
    #[must_use]
    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        self.headers
            .set("Content-Type", "application/x-www-form-urlencoded");
        self.body = Bytes::from(encoded);
        self
    }

    /// Returns a copy of this request pointed at a different URL.
    ///
    /// Extra params are dropped; redirect targets carry their own query.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            method: self.method.clone(),
            url: url.into(),
            params: Vec::new(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}
