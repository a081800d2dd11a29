//! Freshness and revalidation decisions.
//!
//! [`CacheActions`] is built once per request from the request headers, the
//! session [`CacheSettings`] and the per-request [`RequestOptions`]. It then
//! answers two questions:
//!
//! - [`decide`](CacheActions::decide): given what is stored, serve it, revalidate
//!   it, fetch from the network, refuse (cache-only miss), or bypass the cache.
//! - [`update_from_response`](CacheActions::update_from_response): given a live
//!   response, when does it expire and may it be written at all.
//!
//! Expiration precedence, highest first:
//!
//! 1. response `Cache-Control: max-age` (minus `Age`) or `Expires`, when
//!    `cache_control` is on;
//! 2. request `Cache-Control: max-age`;
//! 3. per-request `expire_after`;
//! 4. the first matching `urls_expire_after` row;
//! 5. session `expire_after`.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cache::CachedResponse;
use crate::http::{CacheDirectives, Headers, Request, Response};
use crate::settings::{CacheSettings, ExpireAfter, RequestOptions, StaleSetting};

/// What a lookup found, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    Miss,
    Fresh,
    StaleRevalidatable,
    StaleNoValidator,
    /// Cache-only request with nothing usable stored.
    Rejected,
}

/// How a stale-while-revalidate hit is refreshed in the background.
#[derive(Debug, Clone, PartialEq)]
pub enum Refresh {
    Conditional(Headers),
    Full,
}

/// The outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Return the stored response. `refresh` is set for stale-while-revalidate hits.
    Serve { stale: bool, refresh: Option<Refresh> },
    /// Send a conditional request carrying `headers`.
    Revalidate { headers: Headers, stale_on_error: bool },
    /// Send the request unconditionally.
    Fetch { stale_on_error: bool },
    /// Cache-only request that cannot be satisfied; answer 504.
    Reject,
    /// Neither read from nor write to the cache.
    Bypass,
}

/// Per-request cache behavior.
#[derive(Debug, Clone)]
pub struct CacheActions {
    /// Resolved request-level expiration, replaced by response headers on fetch.
    pub expire_after: ExpireAfter,
    /// Absolute expiration a response stored now would get.
    pub expires: Option<DateTime<Utc>>,
    pub bypass: bool,
    pub skip_write: bool,
    pub only_if_cached: bool,
    /// Request `no-cache`, `max-age=0` or [`RequestOptions::refresh`].
    pub revalidate: bool,
    pub force_refresh: bool,
    pub always_revalidate: bool,
    pub stale_if_error: StaleSetting,
    pub stale_while_revalidate: StaleSetting,
    cache_control: bool,
}

impl CacheActions {
    /// Resolves expiration, bypass and revalidation flags for `request`.
    ///
    /// Request `Cache-Control` directives are honored whether or not
    /// `cache_control` is set; that switch only governs response headers.
    pub fn from_request(
        request: &Request,
        settings: &CacheSettings,
        options: &RequestOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let directives = CacheDirectives::from_headers(request.headers());

        let expire_after = if let Some(max_age) = directives.max_age {
            ExpireAfter::from_seconds(max_age)
        } else if let Some(expire_after) = &options.expire_after {
            expire_after.clone()
        } else if let Some(expire_after) = settings.url_expiration(request.url()) {
            expire_after
        } else {
            settings.expire_after.clone()
        };

        let bypass = settings.disabled
            || directives.no_store
            || expire_after.is_do_not_cache()
            || !settings.allowable_methods.contains(request.method());

        let actions = Self {
            expires: expire_after.expires_at(now),
            expire_after,
            bypass,
            skip_write: bypass || settings.read_only,
            only_if_cached: settings.only_if_cached
                || options.only_if_cached
                || directives.only_if_cached,
            revalidate: directives.no_cache || options.refresh || directives.max_age == Some(0),
            force_refresh: options.force_refresh,
            always_revalidate: settings.always_revalidate,
            stale_if_error: settings.stale_if_error,
            stale_while_revalidate: settings.stale_while_revalidate,
            cache_control: settings.cache_control,
        };
        debug!(
            url = request.url(),
            expire_after = ?actions.expire_after,
            bypass = actions.bypass,
            skip_write = actions.skip_write,
            "resolved cache actions"
        );
        actions
    }

    /// Decides what to do with `cached` (already filtered for `Vary`).
    pub fn decide(&self, cached: Option<&CachedResponse>, now: DateTime<Utc>) -> Decision {
        if self.force_refresh {
            return Decision::Fetch {
                stale_on_error: cached.is_some_and(|c| self.stale_on_error(c, now)),
            };
        }

        if self.only_if_cached {
            return match cached {
                Some(c) if self.usable_offline(c, now) => Decision::Serve {
                    stale: c.is_expired_at(now),
                    refresh: None,
                },
                _ => Decision::Reject,
            };
        }

        if self.bypass {
            return Decision::Bypass;
        }

        let Some(cached) = cached else {
            return Decision::Fetch {
                stale_on_error: false,
            };
        };

        let directives = self.stored_directives(cached);
        let expired = cached.is_expired_at(now);
        if directives.immutable || (!expired && !self.revalidate && !self.always_revalidate) {
            return Decision::Serve {
                stale: false,
                refresh: None,
            };
        }

        let stale_on_error = self.stale_on_error(cached, now);
        let revalidate_or_fetch = || {
            if cached.has_validator() {
                Decision::Revalidate {
                    headers: cached.conditional_headers(),
                    stale_on_error,
                }
            } else {
                Decision::Fetch { stale_on_error }
            }
        };

        if self.revalidate {
            return revalidate_or_fetch();
        }
        if self.always_revalidate {
            return match (cached.has_validator(), expired) {
                (true, _) | (false, true) => revalidate_or_fetch(),
                (false, false) => Decision::Serve {
                    stale: false,
                    refresh: None,
                },
            };
        }

        if !self.stale_blocked(&directives)
            && self.stale_while_revalidate.permits(cached.expires, now)
        {
            let refresh = if cached.has_validator() {
                Refresh::Conditional(cached.conditional_headers())
            } else {
                Refresh::Full
            };
            return Decision::Serve {
                stale: true,
                refresh: Some(refresh),
            };
        }

        revalidate_or_fetch()
    }

    /// What [`decide`](Self::decide) makes of `cached`, as a lookup state.
    pub fn lookup_state(
        &self,
        cached: Option<&CachedResponse>,
        now: DateTime<Utc>,
    ) -> LookupState {
        self.classify(&self.decide(cached, now), cached)
    }

    /// Names the state behind a decision already taken for `cached`.
    ///
    /// Bypassed and force-refreshed lookups never read, so they count as
    /// misses. Anything served without a refresh is fresh.
    pub fn classify(&self, decision: &Decision, cached: Option<&CachedResponse>) -> LookupState {
        match (decision, cached) {
            (Decision::Reject, _) => LookupState::Rejected,
            (Decision::Bypass, _) | (_, None) => LookupState::Miss,
            (Decision::Fetch { .. }, _) if self.force_refresh => LookupState::Miss,
            (Decision::Serve { stale: false, .. }, Some(_)) => LookupState::Fresh,
            (_, Some(c)) if c.has_validator() => LookupState::StaleRevalidatable,
            (_, Some(_)) => LookupState::StaleNoValidator,
        }
    }

    /// Returns `true` if `response` may be written under these actions.
    pub fn should_store(&self, response: &Response, settings: &CacheSettings) -> bool {
        !self.skip_write && settings.is_cacheable(response)
    }

    /// Whether a failed fetch may fall back to `cached`.
    pub fn stale_on_error(&self, cached: &CachedResponse, now: DateTime<Utc>) -> bool {
        !self.stale_blocked(&self.stored_directives(cached))
            && self.stale_if_error.permits(cached.expires, now)
    }

    fn usable_offline(&self, cached: &CachedResponse, now: DateTime<Utc>) -> bool {
        if !cached.is_expired_at(now) {
            return true;
        }
        let directives = self.stored_directives(cached);
        !self.stale_blocked(&directives)
            && (self.stale_if_error.permits(cached.expires, now)
                || self.stale_while_revalidate.permits(cached.expires, now))
    }

    fn stored_directives(&self, cached: &CachedResponse) -> CacheDirectives {
        if self.cache_control {
            cached.directives()
        } else {
            CacheDirectives::default()
        }
    }

    fn stale_blocked(&self, directives: &CacheDirectives) -> bool {
        directives.must_revalidate || directives.no_cache
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;
    use crate::http::Method;
    use crate::key::RequestSnapshot;
    use crate::settings::UrlExpiration;

    fn cached(headers: &[(&str, &str)], expires: Option<DateTime<Utc>>) -> CachedResponse {
        CachedResponse {
            status: 200,
            url: "https://a.com/".into(),
            headers: headers.iter().copied().collect(),
            body: b"cached".to_vec(),
            request: RequestSnapshot {
                method: Method::Get,
                url: "https://a.com/".into(),
                body: Vec::new(),
                headers: Vec::new(),
            },
            created_at: Utc::now(),
            expires,
            revalidated: false,
        }
    }

    fn actions(
        request: &Request,
        settings: &CacheSettings,
        options: &RequestOptions,
        now: DateTime<Utc>,
    ) -> CacheActions {
        CacheActions::from_request(request, settings, options, now)
    }

    fn serve_fresh() -> Decision {
        Decision::Serve {
            stale: false,
            refresh: None,
        }
    }

    #[test]
    fn per_request_expiration_beats_url_table_and_session() {
        let now = Utc::now();
        let settings = CacheSettings {
            expire_after: ExpireAfter::from_seconds(10),
            urls_expire_after: vec![UrlExpiration::new("a.com", ExpireAfter::from_seconds(20))],
            ..CacheSettings::default()
        };
        let request = Request::get("https://a.com/x");

        let a = actions(
            &request,
            &settings,
            &RequestOptions::expire_after(ExpireAfter::from_seconds(60)),
            now,
        );
        assert_eq!(a.expires, Some(now + TimeDelta::seconds(60)));

        let a = actions(&request, &settings, &RequestOptions::default(), now);
        assert_eq!(a.expires, Some(now + TimeDelta::seconds(20)));

        let a = actions(
            &Request::get("https://b.com/"),
            &settings,
            &RequestOptions::default(),
            now,
        );
        assert_eq!(a.expires, Some(now + TimeDelta::seconds(10)));
    }

    #[test]
    fn request_max_age_beats_per_request_option() {
        let now = Utc::now();
        let request = Request::get("https://a.com/").header("Cache-Control", "max-age=5");
        let a = actions(
            &request,
            &CacheSettings::default(),
            &RequestOptions::expire_after(ExpireAfter::from_seconds(60)),
            now,
        );
        assert_eq!(a.expires, Some(now + TimeDelta::seconds(5)));
    }

    #[test]
    fn response_headers_win_only_with_cache_control() {
        let now = Utc::now();
        let request = Request::get("https://a.com/");
        let response = Response::new(200)
            .header("Cache-Control", "max-age=100")
            .header("Age", "40");
        let options = RequestOptions::expire_after(ExpireAfter::from_seconds(10));

        let honoring = CacheSettings {
            cache_control: true,
            ..CacheSettings::default()
        };
        let mut on = actions(&request, &honoring, &options, now);
        on.update_from_response(&response, now);
        assert_eq!(on.expires, Some(now + TimeDelta::seconds(60)));

        let mut off = actions(&request, &CacheSettings::default(), &options, now);
        off.update_from_response(&response, now);
        assert_eq!(off.expires, Some(now + TimeDelta::seconds(10)));
    }

    #[test]
    fn response_storage_directives() {
        let now = Utc::now();
        let settings = CacheSettings {
            cache_control: true,
            ..CacheSettings::default()
        };
        let request = Request::get("https://a.com/");
        let base = actions(&request, &settings, &RequestOptions::default(), now);

        let mut a = base.clone();
        a.update_from_response(&Response::new(200).header("Cache-Control", "no-store"), now);
        assert!(a.skip_write);
        assert!(!a.should_store(&Response::new(200), &settings));

        let mut a = base.clone();
        a.update_from_response(&Response::new(200).header("Cache-Control", "no-cache"), now);
        assert_eq!(a.expires, Some(now));
        assert!(!a.skip_write);

        let mut a = base.clone();
        a.update_from_response(
            &Response::new(200).header("Cache-Control", "max-age=5, immutable"),
            now,
        );
        assert_eq!(a.expires, None);

        let mut a = base;
        a.update_from_response(
            &Response::new(200).header("Expires", "Wed, 21 Oct 2015 07:28:00 GMT"),
            now,
        );
        assert!(a.expires.is_some_and(|e| e < now));
    }

    #[test]
    fn url_table_scenario() {
        let now = Utc::now();
        let settings = CacheSettings {
            urls_expire_after: vec![
                UrlExpiration::new("*.a.com", ExpireAfter::from_seconds(30)),
                UrlExpiration::new("*", ExpireAfter::DoNotCache),
            ],
            ..CacheSettings::default()
        };
        let hit = actions(
            &Request::get("https://x.a.com/"),
            &settings,
            &RequestOptions::default(),
            now,
        );
        assert!(!hit.bypass);
        assert_eq!(hit.expires, Some(now + TimeDelta::seconds(30)));

        let other = actions(
            &Request::get("https://y.com/"),
            &settings,
            &RequestOptions::default(),
            now,
        );
        assert!(other.bypass && other.skip_write);
        assert_eq!(other.decide(Some(&cached(&[], None)), now), Decision::Bypass);
    }

    #[test]
    fn bypass_conditions() {
        let now = Utc::now();
        let settings = CacheSettings::default();
        let stored = cached(&[], None);

        let post = actions(
            &Request::post("https://a.com/"),
            &settings,
            &RequestOptions::default(),
            now,
        );
        assert_eq!(post.decide(Some(&stored), now), Decision::Bypass);

        let no_store = Request::get("https://a.com/").header("Cache-Control", "no-store");
        let a = actions(&no_store, &settings, &RequestOptions::default(), now);
        assert_eq!(a.decide(Some(&stored), now), Decision::Bypass);

        let disabled = CacheSettings {
            disabled: true,
            ..CacheSettings::default()
        };
        let a = actions(
            &Request::get("https://a.com/"),
            &disabled,
            &RequestOptions::default(),
            now,
        );
        assert_eq!(a.decide(Some(&stored), now), Decision::Bypass);

        let read_only = CacheSettings {
            read_only: true,
            ..CacheSettings::default()
        };
        let a = actions(
            &Request::get("https://a.com/"),
            &read_only,
            &RequestOptions::default(),
            now,
        );
        assert!(a.skip_write && !a.bypass);
        assert_eq!(a.decide(Some(&stored), now), serve_fresh());
    }

    #[test]
    fn miss_fetches_and_fresh_serves() {
        let now = Utc::now();
        let a = actions(
            &Request::get("https://a.com/"),
            &CacheSettings::default(),
            &RequestOptions::default(),
            now,
        );
        assert_eq!(a.decide(None, now), Decision::Fetch { stale_on_error: false });
        assert_eq!(a.lookup_state(None, now), LookupState::Miss);

        let fresh = cached(&[], Some(now + TimeDelta::seconds(30)));
        assert_eq!(a.decide(Some(&fresh), now), serve_fresh());
        assert_eq!(a.lookup_state(Some(&fresh), now), LookupState::Fresh);
    }

    #[test]
    fn freshness_is_monotonic() {
        let now = Utc::now();
        let expires = now + TimeDelta::seconds(30);
        let stored = cached(&[], Some(expires));
        let a = actions(
            &Request::get("https://a.com/"),
            &CacheSettings::default(),
            &RequestOptions::default(),
            now,
        );
        let mut became_stale = false;
        for offset in (0..60).step_by(5) {
            let t = now + TimeDelta::seconds(offset);
            let fresh = a.decide(Some(&stored), t) == serve_fresh();
            assert!(!(became_stale && fresh), "fresh again at +{offset}s");
            became_stale |= !fresh;
            assert_eq!(fresh, t < expires);
        }
    }

    #[test]
    fn expired_entry_revalidates_with_validators() {
        let now = Utc::now();
        let a = actions(
            &Request::get("https://a.com/"),
            &CacheSettings::default(),
            &RequestOptions::default(),
            now,
        );
        let stored = cached(
            &[("ETag", "\"v1\""), ("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")],
            Some(now - TimeDelta::seconds(1)),
        );
        match a.decide(Some(&stored), now) {
            Decision::Revalidate { headers, stale_on_error } => {
                assert_eq!(headers.get("if-none-match"), Some("\"v1\""));
                assert!(headers.contains("if-modified-since"));
                assert!(!stale_on_error);
            }
            other => panic!("expected revalidation, got {other:?}"),
        }
        assert_eq!(a.lookup_state(Some(&stored), now), LookupState::StaleRevalidatable);

        let no_validator = cached(&[], Some(now - TimeDelta::seconds(1)));
        assert_eq!(a.lookup_state(Some(&no_validator), now), LookupState::StaleNoValidator);
    }

    #[test]
    fn stale_if_error_window() {
        let now = Utc::now();
        let settings = CacheSettings {
            stale_if_error: StaleSetting::Within(Duration::from_secs(60)),
            ..CacheSettings::default()
        };
        let a = actions(
            &Request::get("https://a.com/"),
            &settings,
            &RequestOptions::default(),
            now,
        );
        let recent = cached(&[], Some(now - TimeDelta::seconds(10)));
        let ancient = cached(&[], Some(now - TimeDelta::seconds(600)));
        assert_eq!(a.decide(Some(&recent), now), Decision::Fetch { stale_on_error: true });
        assert_eq!(a.decide(Some(&ancient), now), Decision::Fetch { stale_on_error: false });
    }

    #[test]
    fn request_no_cache_forces_revalidation() {
        let now = Utc::now();
        let request = Request::get("https://a.com/").header("Cache-Control", "no-cache");
        let a = actions(&request, &CacheSettings::default(), &RequestOptions::default(), now);
        let fresh = cached(&[("ETag", "\"v1\"")], Some(now + TimeDelta::seconds(60)));
        assert!(matches!(a.decide(Some(&fresh), now), Decision::Revalidate { .. }));

        let immutable = CacheSettings {
            cache_control: true,
            ..CacheSettings::default()
        };
        let a = actions(&request, &immutable, &RequestOptions::default(), now);
        let stored = cached(&[("Cache-Control", "immutable")], Some(now - TimeDelta::seconds(1)));
        assert_eq!(a.decide(Some(&stored), now), serve_fresh());
    }

    #[test]
    fn stale_while_revalidate_serves_and_schedules_refresh() {
        let now = Utc::now();
        let settings = CacheSettings {
            stale_while_revalidate: StaleSetting::Unbounded,
            cache_control: true,
            ..CacheSettings::default()
        };
        let a = actions(
            &Request::get("https://a.com/"),
            &settings,
            &RequestOptions::default(),
            now,
        );
        let expired = Some(now - TimeDelta::seconds(5));

        let with_etag = cached(&[("ETag", "\"v1\"")], expired);
        match a.decide(Some(&with_etag), now) {
            Decision::Serve { stale: true, refresh: Some(Refresh::Conditional(h)) } => {
                assert_eq!(h.get("if-none-match"), Some("\"v1\""));
            }
            other => panic!("unexpected {other:?}"),
        }
        let plain = cached(&[], expired);
        assert_eq!(
            a.decide(Some(&plain), now),
            Decision::Serve { stale: true, refresh: Some(Refresh::Full) }
        );

        let must = cached(&[("Cache-Control", "must-revalidate")], expired);
        assert_eq!(a.decide(Some(&must), now), Decision::Fetch { stale_on_error: false });
    }

    #[test]
    fn always_revalidate_rules() {
        let now = Utc::now();
        let settings = CacheSettings {
            always_revalidate: true,
            stale_while_revalidate: StaleSetting::Unbounded,
            ..CacheSettings::default()
        };
        let a = actions(
            &Request::get("https://a.com/"),
            &settings,
            &RequestOptions::default(),
            now,
        );
        let later = Some(now + TimeDelta::seconds(60));
        let earlier = Some(now - TimeDelta::seconds(60));

        assert!(matches!(
            a.decide(Some(&cached(&[("ETag", "\"v\"")], later)), now),
            Decision::Revalidate { .. }
        ));
        assert_eq!(a.decide(Some(&cached(&[], later)), now), serve_fresh());
        assert_eq!(
            a.decide(Some(&cached(&[], earlier)), now),
            Decision::Fetch { stale_on_error: false }
        );
    }

    #[test]
    fn only_if_cached_never_touches_network() {
        let now = Utc::now();
        let options = RequestOptions {
            only_if_cached: true,
            ..RequestOptions::default()
        };
        let a = actions(&Request::get("https://a.com/"), &CacheSettings::default(), &options, now);
        assert_eq!(a.decide(None, now), Decision::Reject);
        assert_eq!(a.lookup_state(None, now), LookupState::Rejected);

        let expired = cached(&[], Some(now - TimeDelta::seconds(1)));
        assert_eq!(a.decide(Some(&expired), now), Decision::Reject);

        let fresh = cached(&[], None);
        assert_eq!(a.decide(Some(&fresh), now), serve_fresh());

        let lenient = CacheSettings {
            stale_if_error: StaleSetting::Unbounded,
            ..CacheSettings::default()
        };
        let a = actions(&Request::get("https://a.com/"), &lenient, &options, now);
        assert_eq!(
            a.decide(Some(&expired), now),
            Decision::Serve { stale: true, refresh: None }
        );
    }

    #[test]
    fn force_refresh_skips_the_read() {
        let now = Utc::now();
        let options = RequestOptions {
            force_refresh: true,
            ..RequestOptions::default()
        };
        let a = actions(&Request::get("https://a.com/"), &CacheSettings::default(), &options, now);
        assert_eq!(
            a.decide(Some(&cached(&[], None)), now),
            Decision::Fetch { stale_on_error: false }
        );
        assert!(!a.skip_write);
    }

    #[test]
    fn lookup_state_follows_the_decision() {
        let now = Utc::now();
        let expired = Some(now - TimeDelta::seconds(5));
        let fresh = Some(now + TimeDelta::seconds(60));
        let request = Request::get("https://a.com/");
        let defaults = RequestOptions::default();

        let honoring = CacheSettings {
            cache_control: true,
            ..CacheSettings::default()
        };
        let a = actions(&request, &honoring, &defaults, now);
        let immutable = cached(&[("Cache-Control", "immutable")], expired);
        assert_eq!(a.decide(Some(&immutable), now), serve_fresh());
        assert_eq!(a.lookup_state(Some(&immutable), now), LookupState::Fresh);

        let always = CacheSettings {
            always_revalidate: true,
            ..CacheSettings::default()
        };
        let a = actions(&request, &always, &defaults, now);
        let validated = cached(&[("ETag", "\"v\"")], fresh);
        assert!(matches!(a.decide(Some(&validated), now), Decision::Revalidate { .. }));
        assert_eq!(
            a.lookup_state(Some(&validated), now),
            LookupState::StaleRevalidatable
        );

        let post = actions(&Request::post("https://a.com/"), &honoring, &defaults, now);
        let stored = cached(&[], fresh);
        assert_eq!(post.decide(Some(&stored), now), Decision::Bypass);
        assert_eq!(post.lookup_state(Some(&stored), now), LookupState::Miss);

        let swr = CacheSettings {
            stale_while_revalidate: StaleSetting::Unbounded,
            ..CacheSettings::default()
        };
        let a = actions(&request, &swr, &defaults, now);
        let stale = cached(&[], expired);
        assert!(matches!(a.decide(Some(&stale), now), Decision::Serve { stale: true, .. }));
        assert_eq!(a.lookup_state(Some(&stale), now), LookupState::StaleNoValidator);

        let forced = RequestOptions {
            force_refresh: true,
            ..RequestOptions::default()
        };
        let a = actions(&request, &honoring, &forced, now);
        assert_eq!(a.lookup_state(Some(&stored), now), LookupState::Miss);
    }
}
