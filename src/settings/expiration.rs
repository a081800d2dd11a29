//! Expiration values and the URL-pattern expiration table.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

/// How long a response stays fresh.
///
/// Deserializes from:
///
/// | Value                     | Meaning                                   |
/// |---------------------------|-------------------------------------------|
/// | `30`                      | fresh for 30 seconds                      |
/// | `-1` / `"never"`          | never expires                             |
/// | `0` / `"expire_immediately"` | stored, but stale right away          |
/// | `"do_not_cache"`          | neither read from nor written to the cache |
/// | `"2030-01-01T00:00:00Z"`  | fresh until that instant                  |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ExpireAfterRepr", into = "ExpireAfterRepr")]
pub enum ExpireAfter {
    Duration(Duration),
    At(DateTime<Utc>),
    NeverExpire,
    DoNotCache,
    ExpireImmediately,
}

impl ExpireAfter {
    /// Interprets a signed number of seconds the way `Cache-Control` and
    /// settings files use it: negative means never, zero means immediately.
    pub fn from_seconds(seconds: i64) -> Self {
        match seconds {
            s if s < 0 => Self::NeverExpire,
            0 => Self::ExpireImmediately,
            s => Self::Duration(Duration::from_secs(s.unsigned_abs())),
        }
    }

    pub fn is_do_not_cache(&self) -> bool {
        matches!(self, Self::DoNotCache)
    }

    /// The absolute expiration for a response stored at `now`; `None` never expires.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::NeverExpire => None,
            Self::DoNotCache | Self::ExpireImmediately => Some(now),
            Self::At(at) => Some(*at),
            Self::Duration(ttl) => {
                let delta = TimeDelta::from_std(*ttl).ok()?;
                now.checked_add_signed(delta)
            }
        }
    }
}

impl Default for ExpireAfter {
    fn default() -> Self {
        Self::NeverExpire
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ExpireAfterRepr {
    Seconds(i64),
    Keyword(String),
}

impl TryFrom<ExpireAfterRepr> for ExpireAfter {
    type Error = String;

    fn try_from(repr: ExpireAfterRepr) -> Result<Self, Self::Error> {
        match repr {
            ExpireAfterRepr::Seconds(seconds) => Ok(Self::from_seconds(seconds)),
            ExpireAfterRepr::Keyword(word) => match word.as_str() {
                "never" => Ok(Self::NeverExpire),
                "do_not_cache" => Ok(Self::DoNotCache),
                "expire_immediately" => Ok(Self::ExpireImmediately),
                other => DateTime::parse_from_rfc3339(other)
                    .map(|at| Self::At(at.with_timezone(&Utc)))
                    .map_err(|e| format!("invalid expire_after value `{other}`: {e}")),
            },
        }
    }
}

impl From<ExpireAfter> for ExpireAfterRepr {
    fn from(value: ExpireAfter) -> Self {
        match value {
            ExpireAfter::Duration(ttl) => Self::Seconds(ttl.as_secs().min(i64::MAX as u64) as i64),
            ExpireAfter::At(at) => Self::Keyword(at.to_rfc3339()),
            ExpireAfter::NeverExpire => Self::Keyword("never".into()),
            ExpireAfter::DoNotCache => Self::Keyword("do_not_cache".into()),
            ExpireAfter::ExpireImmediately => Self::Keyword("expire_immediately".into()),
        }
    }
}

/// Whether (and for how long past expiration) a stale response may be served.
///
/// Deserializes from a bool or a number of seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StaleRepr", into = "StaleRepr")]
pub enum StaleSetting {
    #[default]
    Disabled,
    Unbounded,
    Within(Duration),
}

impl StaleSetting {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Returns `true` if a response that expired at `expires` may still be served at `now`.
    pub fn permits(&self, expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Disabled => false,
            Self::Unbounded => true,
            Self::Within(window) => match (expires, TimeDelta::from_std(*window)) {
                (None, _) => true,
                (Some(expires), Ok(window)) => expires
                    .checked_add_signed(window)
                    .is_none_or(|limit| now < limit),
                (Some(_), Err(_)) => true,
            },
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum StaleRepr {
    Flag(bool),
    Seconds(u64),
}

impl From<StaleRepr> for StaleSetting {
    fn from(repr: StaleRepr) -> Self {
        match repr {
            StaleRepr::Flag(true) => Self::Unbounded,
            StaleRepr::Flag(false) => Self::Disabled,
            StaleRepr::Seconds(secs) => Self::Within(Duration::from_secs(secs)),
        }
    }
}

impl From<StaleSetting> for StaleRepr {
    fn from(setting: StaleSetting) -> Self {
        match setting {
            StaleSetting::Disabled => Self::Flag(false),
            StaleSetting::Unbounded => Self::Flag(true),
            StaleSetting::Within(window) => Self::Seconds(window.as_secs()),
        }
    }
}

/// One row of the URL-pattern expiration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlExpiration {
    pub pattern: String,
    pub expire_after: ExpireAfter,
}

impl UrlExpiration {
    pub fn new(pattern: impl Into<String>, expire_after: ExpireAfter) -> Self {
        Self {
            pattern: pattern.into(),
            expire_after,
        }
    }

    /// Compiles the pattern as it is matched: scheme stripped, trailing `*` implied.
    pub(crate) fn compile(&self) -> Result<Pattern, glob::PatternError> {
        let base = strip_scheme(&self.pattern).trim_end_matches('*');
        Pattern::new(&format!("{base}*"))
    }

    /// Returns `true` if this row applies to `url`.
    ///
    /// Matching is case-insensitive against the URL without scheme, query or
    /// fragment, and `*` may span `/`. An invalid pattern matches nothing.
    pub fn matches(&self, url: &str) -> bool {
        let Ok(pattern) = self.compile() else {
            return false;
        };
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        pattern.matches_with(base_url(url), options)
    }
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

fn base_url(url: &str) -> &str {
    let rest = strip_scheme(url);
    rest.split(['?', '#']).next().unwrap_or(rest)
}
