//! Per-request cookie view used by session stores.

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use time::Duration;

/// The cookies a request arrived with, plus the changes a store has made
/// that must be sent back to the client.
///
/// Incoming cookies are kept exactly as sent, so a name that appears twice
/// can be detected. Reads consult pending changes first, so a store observes
/// its own writes within a request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    incoming: Vec<Cookie<'static>>,
    pending: Vec<Cookie<'static>>,
}

/// Returns true if `cookie` instructs the client to delete the cookie.
#[must_use]
pub fn is_removal(cookie: &Cookie<'_>) -> bool {
    cookie.max_age() == Some(Duration::ZERO)
}

impl RequestContext {
    /// Builds a context from the request's `Cookie` headers.
    ///
    /// Unparseable cookie pairs are skipped.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let incoming = headers
            .get_all(COOKIE)
            .into_iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| {
                Cookie::split_parse(value.to_string())
                    .filter_map(Result::ok)
                    .map(Cookie::into_owned)
                    .collect::<Vec<_>>()
            })
            .collect();
        Self::from_cookies(incoming)
    }

    /// Builds a context from already-parsed cookies.
    #[must_use]
    pub fn from_cookies(incoming: Vec<Cookie<'static>>) -> Self {
        Self {
            incoming,
            pending: Vec::new(),
        }
    }

    /// Returns every value visible for `name`: the pending value when a
    /// store changed the cookie in this request, otherwise each value the
    /// client sent.
    #[must_use]
    pub fn cookie_values(&self, name: &str) -> Vec<String> {
        if let Some(changed) = self.pending.iter().find(|c| c.name() == name) {
            return if is_removal(changed) {
                Vec::new()
            } else {
                vec![changed.value().to_string()]
            };
        }
        self.incoming
            .iter()
            .filter(|c| c.name() == name)
            .map(|c| c.value().to_string())
            .collect()
    }

    /// Returns the single visible value for `name`, if exactly one exists.
    #[must_use]
    pub fn cookie_value(&self, name: &str) -> Option<String> {
        let mut values = self.cookie_values(name);
        if values.len() == 1 { values.pop() } else { None }
    }

    /// Names of the cookies the client sent.
    pub fn incoming_names(&self) -> impl Iterator<Item = &str> {
        self.incoming.iter().map(|c| c.name())
    }

    /// Names that currently have a visible value, incoming or pending.
    #[must_use]
    pub fn visible_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let candidates = self
            .incoming
            .iter()
            .chain(self.pending.iter())
            .map(|c| c.name());
        for name in candidates {
            if !names.iter().any(|n| n == name) && !self.cookie_values(name).is_empty() {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Queues a cookie to be set on the response, replacing any earlier
    /// change to the same name.
    pub fn set_cookie(&mut self, cookie: Cookie<'static>) {
        self.pending.retain(|c| c.name() != cookie.name());
        self.pending.push(cookie);
    }

    /// Queues removal of a cookie. `template` supplies the path and domain
    /// the cookie was set with.
    pub fn remove_cookie(&mut self, mut template: Cookie<'static>) {
        template.make_removal();
        self.set_cookie(template);
    }

    /// Returns true if a store has queued any change.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns the queued changes.
    pub fn changes(&self) -> impl Iterator<Item = &Cookie<'static>> {
        self.pending.iter()
    }

    /// Returns a jar carrying the queued changes, ready to be attached to a
    /// response.
    #[must_use]
    pub fn into_jar(self) -> CookieJar {
        self.pending
            .into_iter()
            .fold(CookieJar::new(), |jar, cookie| jar.add(cookie))
    }

    /// Builds the context a client would send on its next request after
    /// applying this request's changes.
    #[must_use]
    pub fn next_request(&self) -> Self {
        let mut cookies: Vec<Cookie<'static>> = self
            .incoming
            .iter()
            .filter(|c| !self.pending.iter().any(|p| p.name() == c.name()))
            .cloned()
            .collect();
        cookies.extend(
            self.pending
                .iter()
                .filter(|c| !is_removal(c))
                .map(|c| Cookie::new(c.name().to_string(), c.value().to_string())),
        );
        Self::from_cookies(cookies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(COOKIE, HeaderValue::from_str(value).expect("header value"));
        }
        headers
    }

    #[test]
    fn parses_multiple_cookie_headers() {
        let ctx = RequestContext::from_headers(&headers(&["a=1; b=2", "c=3"]));
        assert_eq!(ctx.cookie_value("a").as_deref(), Some("1"));
        assert_eq!(ctx.cookie_value("b").as_deref(), Some("2"));
        assert_eq!(ctx.cookie_value("c").as_deref(), Some("3"));
        assert!(!ctx.has_changes());
    }

    #[test]
    fn duplicate_names_are_preserved() {
        let ctx = RequestContext::from_headers(&headers(&["a=1; a=2"]));
        assert_eq!(ctx.cookie_values("a"), vec!["1".to_string(), "2".to_string()]);
        assert_eq!(ctx.cookie_value("a"), None);
    }

    #[test]
    fn pending_set_overrides_incoming() {
        let mut ctx = RequestContext::from_headers(&headers(&["a=1; a=2"]));
        ctx.set_cookie(Cookie::new("a", "3"));
        assert_eq!(ctx.cookie_values("a"), vec!["3".to_string()]);
        assert!(ctx.has_changes());
    }

    #[test]
    fn pending_removal_hides_incoming() {
        let mut ctx = RequestContext::from_headers(&headers(&["a=1"]));
        ctx.remove_cookie(Cookie::build("a").path("/").build());
        assert!(ctx.cookie_values("a").is_empty());
        let changes: Vec<_> = ctx.changes().collect();
        assert_eq!(changes.len(), 1);
        assert!(is_removal(changes[0]));
    }

    #[test]
    fn later_change_replaces_earlier_one() {
        let mut ctx = RequestContext::default();
        ctx.set_cookie(Cookie::new("a", "1"));
        ctx.remove_cookie(Cookie::new("a", ""));
        assert_eq!(ctx.changes().count(), 1);
        assert!(ctx.cookie_values("a").is_empty());
    }

    #[test]
    fn next_request_applies_changes() {
        let mut ctx = RequestContext::from_headers(&headers(&["keep=1; gone=2; swap=3"]));
        ctx.remove_cookie(Cookie::new("gone", ""));
        ctx.set_cookie(Cookie::new("swap", "4"));
        ctx.set_cookie(Cookie::new("new", "5"));

        let next = ctx.next_request();
        assert_eq!(next.cookie_value("keep").as_deref(), Some("1"));
        assert_eq!(next.cookie_value("gone"), None);
        assert_eq!(next.cookie_value("swap").as_deref(), Some("4"));
        assert_eq!(next.cookie_value("new").as_deref(), Some("5"));
        assert!(!next.has_changes());
    }

    #[test]
    fn missing_header_yields_empty_context() {
        let ctx = RequestContext::from_headers(&HeaderMap::new());
        assert_eq!(ctx.incoming_names().count(), 0);
        assert!(ctx.cookie_values("a").is_empty());
    }
}
