//! `Cache-Control`, `Expires` and `Age` parsing.

use chrono::{DateTime, Utc};

use super::Headers;

/// Freshness directives read from a request or response header map.
///
/// Unknown directives are ignored. Repeated `Cache-Control` headers are merged
/// as if they were a single comma-separated list.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::{CacheDirectives, Headers};
///
/// let mut headers = Headers::new();
/// headers.insert("Cache-Control", "public, max-age=60, must-revalidate");
///
/// let directives = CacheDirectives::from_headers(&headers);
/// assert_eq!(directives.max_age, Some(60));
/// assert!(directives.must_revalidate);
/// assert!(!directives.no_store);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub max_age: Option<i64>,
    pub no_cache: bool,
    pub no_store: bool,
    pub only_if_cached: bool,
    pub must_revalidate: bool,
    pub immutable: bool,
    /// Parsed `Expires`. An unparseable value means "already expired" (RFC 9111 §5.3).
    pub expires: Option<DateTime<Utc>>,
    /// Seconds the response spent in upstream caches, from `Age`.
    pub age: Option<i64>,
}

impl CacheDirectives {
    pub fn from_headers(headers: &Headers) -> Self {
        let mut directives = Self::default();

        for value in headers.get_all("cache-control") {
            for directive in value.split(',') {
                let directive = directive.trim();
                if directive.is_empty() {
                    continue;
                }
                let (name, arg) = match directive.split_once('=') {
                    Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match name.to_ascii_lowercase().as_str() {
                    "max-age" => {
                        directives.max_age =
                            arg.and_then(|a| a.parse::<i64>().ok()).map(|a| a.max(0));
                    }
                    "no-cache" => directives.no_cache = true,
                    "no-store" => directives.no_store = true,
                    "only-if-cached" => directives.only_if_cached = true,
                    "must-revalidate" => directives.must_revalidate = true,
                    "immutable" => directives.immutable = true,
                    _ => {}
                }
            }
        }

        directives.expires = headers
            .get("expires")
            .map(|v| parse_http_date(v).unwrap_or(DateTime::<Utc>::MIN_UTC));
        directives.age = headers.get("age").and_then(|v| v.trim().parse().ok());
        directives
    }
}

/// Parses an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Formats a timestamp as an IMF-fixdate.
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().copied().collect()
    }

    #[test]
    fn merges_repeated_cache_control_headers() {
        let d = CacheDirectives::from_headers(&headers(&[
            ("Cache-Control", "no-cache"),
            ("cache-control", "max-age=30, immutable"),
        ]));
        assert!(d.no_cache);
        assert!(d.immutable);
        assert_eq!(d.max_age, Some(30));
    }

    #[test]
    fn quoted_and_negative_max_age() {
        let d = CacheDirectives::from_headers(&headers(&[("Cache-Control", "max-age=\"15\"")]));
        assert_eq!(d.max_age, Some(15));
        let d = CacheDirectives::from_headers(&headers(&[("Cache-Control", "max-age=-5")]));
        assert_eq!(d.max_age, Some(0));
    }

    #[test]
    fn invalid_expires_is_already_expired() {
        let d = CacheDirectives::from_headers(&headers(&[("Expires", "0")]));
        assert_eq!(d.expires, Some(DateTime::<Utc>::MIN_UTC));
    }

    #[test]
    fn http_date_round_trip() {
        let date = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        let formatted = format_http_date(date);
        assert_eq!(formatted, "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_http_date(&formatted), Some(date));
    }

    #[test]
    fn reads_age_and_only_if_cached() {
        let d = CacheDirectives::from_headers(&headers(&[
            ("Cache-Control", "only-if-cached"),
            ("Age", "12"),
        ]));
        assert!(d.only_if_cached);
        assert_eq!(d.age, Some(12));
    }
}
