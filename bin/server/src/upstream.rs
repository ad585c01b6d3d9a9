//! Forwarding authenticated requests to the protected service.

use crate::config::HeaderConfig;
use crate::error::StartupError;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use gatehouse_session::SessionState;
use rootcause::prelude::Report;
use tracing::{debug, warn};

/// Largest request body buffered for forwarding.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub const USER_HEADER: &str = "x-forwarded-user";
pub const EMAIL_HEADER: &str = "x-forwarded-email";
pub const PREFERRED_USERNAME_HEADER: &str = "x-forwarded-preferred-username";
pub const GROUPS_HEADER: &str = "x-forwarded-groups";
pub const ACCESS_TOKEN_HEADER: &str = "x-forwarded-access-token";

const IDENTITY_HEADERS: [&str; 5] = [
    USER_HEADER,
    EMAIL_HEADER,
    PREFERRED_USERNAME_HEADER,
    GROUPS_HEADER,
    ACCESS_TOKEN_HEADER,
];

const HOP_BY_HOP: [&str; 5] = [
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// The service behind the gateway.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Serves a request the pipeline has authenticated.
    async fn serve(&self, request: Request<Body>) -> Response;
}

/// Replaces any identity headers the client sent with the session's.
pub fn apply_identity(headers: &mut HeaderMap, session: &SessionState, config: &HeaderConfig) {
    for name in IDENTITY_HEADERS {
        headers.remove(name);
    }

    let mut set = |name: &'static str, value: &str| match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => debug!(header = name, "identity value is not a valid header value"),
    };

    if config.pass_user_headers {
        set(USER_HEADER, session.user());
        if let Some(email) = session.email() {
            set(EMAIL_HEADER, email);
        }
        if let Some(username) = session.preferred_username() {
            set(PREFERRED_USERNAME_HEADER, username);
        }
        if !session.groups().is_empty() {
            set(GROUPS_HEADER, &session.groups().join(","));
        }
    }
    if config.pass_access_token {
        if let Some(token) = session.access_token() {
            set(ACCESS_TOKEN_HEADER, token);
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too.
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()))
        .filter(|s| !s.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

/// Forwards requests over HTTP to a fixed base URL.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base: String,
}

impl HttpUpstream {
    /// Creates an upstream rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::Configuration` if the URL is not an absolute
    /// http(s) URL or the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, Report<StartupError>> {
        let url = reqwest::Url::parse(base_url).map_err(|e| StartupError::Configuration {
            details: format!("invalid upstream_url: {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StartupError::Configuration {
                details: format!("upstream_url scheme '{}' is not http(s)", url.scheme()),
            }
            .into());
        }

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StartupError::Configuration {
                details: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base: url.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Returns the upstream URL for a request URI.
    #[must_use]
    pub fn target(&self, uri: &Uri) -> String {
        let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
        format!("{}{}", self.base, path)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn serve(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
            }
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);

        let target = self.target(&parts.uri);
        let sent = self
            .client
            .request(parts.method, &target)
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, "upstream request failed");
                return bad_gateway();
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        match upstream.bytes().await {
            Ok(bytes) => {
                let mut response = Response::new(Body::from(bytes));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                warn!(error = %e, "failed to read upstream response");
                bad_gateway()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fresh_session, request_headers};

    #[test]
    fn client_identity_headers_are_replaced() {
        let mut headers = request_headers(&[
            ("x-forwarded-user", "mallory"),
            ("x-forwarded-access-token", "forged"),
            ("accept", "text/html"),
        ]);
        apply_identity(&mut headers, &fresh_session(), &HeaderConfig::default());

        assert_eq!(headers.get(USER_HEADER).map(|v| v.as_bytes()), Some(&b"user-1"[..]));
        assert_eq!(
            headers.get(EMAIL_HEADER).map(|v| v.as_bytes()),
            Some(&b"user-1@example.com"[..])
        );
        assert_eq!(
            headers.get(GROUPS_HEADER).map(|v| v.as_bytes()),
            Some(&b"staff,ops"[..])
        );
        assert!(headers.get(ACCESS_TOKEN_HEADER).is_none());
        assert!(headers.get(PREFERRED_USERNAME_HEADER).is_none());
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn access_token_is_passed_when_enabled() {
        let mut headers = HeaderMap::new();
        let config = HeaderConfig {
            pass_user_headers: false,
            pass_access_token: true,
        };
        apply_identity(&mut headers, &fresh_session(), &config);

        assert!(headers.get(USER_HEADER).is_none());
        assert_eq!(
            headers.get(ACCESS_TOKEN_HEADER).map(|v| v.as_bytes()),
            Some(&b"access-1"[..])
        );
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = request_headers(&[
            ("connection", "keep-alive, x-private"),
            ("keep-alive", "timeout=5"),
            ("x-private", "1"),
            ("x-kept", "1"),
        ]);
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-kept"));
    }

    #[test]
    fn target_joins_base_and_path() {
        let upstream = HttpUpstream::new("http://127.0.0.1:8080/").expect("upstream");
        assert_eq!(
            upstream.target(&Uri::from_static("/app?x=1")),
            "http://127.0.0.1:8080/app?x=1"
        );
    }

    #[test]
    fn upstream_url_must_be_http() {
        let err = HttpUpstream::new("ftp://example.com").expect_err("accepted ftp");
        assert!(matches!(
            err.current_context(),
            StartupError::Configuration { .. }
        ));
        assert!(HttpUpstream::new("not a url").is_err());
    }
}
