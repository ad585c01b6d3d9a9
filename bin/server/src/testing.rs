//! Fakes shared by the gateway's tests.

use crate::upstream::Upstream;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{Duration as ChronoDuration, Utc};
use gatehouse_access::{
    BearerTokenAuthenticator, IssuerVerifier, JwtVerifier, LoginRequest, LoginState, Provider,
    ProviderError, TokenToSessionLoader,
};
use gatehouse_session::{
    CookieOptions, CookieStore, RefreshLock, RequestContext, SessionCodec, SessionState,
    SessionStore, StoreError,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode};
use rootcause::prelude::Report;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BEARER_ISSUER: &str = "https://tokens.example.com";
const BEARER_SECRET: &[u8] = b"bearer-test-secret";

pub fn cookie_store() -> Arc<dyn SessionStore> {
    Arc::new(CookieStore::new(SessionCodec::new([7u8; 32]), CookieOptions::default()).expect("store"))
}

pub fn fresh_session() -> SessionState {
    SessionState::new("user-1", Utc::now() - ChronoDuration::minutes(5))
        .with_email(Some("user-1@example.com".to_string()))
        .with_tokens(
            Some("access-1".to_string()),
            Some("id-1".to_string()),
            Some("refresh-1".to_string()),
        )
        .with_expires_on(Some(Utc::now() + ChronoDuration::hours(1)))
        .with_groups(vec!["staff".to_string(), "ops".to_string()])
}

pub fn expired_session() -> SessionState {
    fresh_session().with_expires_on(Some(Utc::now() - ChronoDuration::minutes(1)))
}

pub fn request_headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.append(
            HeaderName::from_bytes(name.as_bytes()).expect("name"),
            HeaderValue::from_str(value).expect("value"),
        );
    }
    headers
}

pub fn mint_bearer(ttl_seconds: i64) -> String {
    let claims = json!({
        "iss": BEARER_ISSUER,
        "sub": "bearer-user",
        "email": "bearer@example.com",
        "exp": Utc::now().timestamp() + ttl_seconds,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(BEARER_SECRET)).expect("mint")
}

pub fn bearer_authenticator() -> BearerTokenAuthenticator {
    let verifier: Arc<dyn IssuerVerifier> = Arc::new(
        JwtVerifier::new(BEARER_ISSUER)
            .with_algorithms(vec![Algorithm::HS256])
            .with_key(None, DecodingKey::from_secret(BEARER_SECRET)),
    );
    BearerTokenAuthenticator::new(vec![TokenToSessionLoader::new(verifier)])
}

/// Wraps a store and counts loads; can be made unreachable.
pub struct CountingStore {
    inner: Arc<dyn SessionStore>,
    loads: AtomicUsize,
    unreachable: bool,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn SessionStore>) -> Self {
        Self {
            inner,
            loads: AtomicUsize::new(0),
            unreachable: false,
        }
    }

    /// Fails loads and connection checks.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for CountingStore {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn save(
        &self,
        ctx: &mut RequestContext,
        session: &SessionState,
    ) -> Result<(), Report<StoreError>> {
        self.inner.save(ctx, session).await
    }

    async fn load(&self, ctx: &RequestContext) -> Result<Option<SessionState>, Report<StoreError>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(StoreError::Unavailable {
                details: "connection refused".to_string(),
            }
            .into());
        }
        self.inner.load(ctx).await
    }

    async fn clear(&self, ctx: &mut RequestContext) -> Result<(), Report<StoreError>> {
        self.inner.clear(ctx).await
    }

    fn refresh_lock(&self, ctx: &RequestContext) -> Arc<dyn RefreshLock> {
        self.inner.refresh_lock(ctx)
    }

    async fn verify_connection(&self) -> Result<(), Report<StoreError>> {
        if self.unreachable {
            return Err(StoreError::Unavailable {
                details: "connection refused".to_string(),
            }
            .into());
        }
        self.inner.verify_connection().await
    }
}

/// Provider with canned answers.
pub struct StaticProvider {
    refresh_calls: AtomicUsize,
    reject_refresh: bool,
    delay: Option<Duration>,
}

pub const GOOD_CODE: &str = "good-code";
pub const LOGIN_CSRF: &str = "csrf-1";

impl StaticProvider {
    pub fn succeeding() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            reject_refresh: false,
            delay: None,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_refresh: true,
            ..Self::succeeding()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    fn login_url(&self, redirect: &str) -> LoginRequest {
        LoginRequest {
            url: format!("https://idp.example.com/authorize?state={LOGIN_CSRF}"),
            state: LoginState {
                csrf_token: LOGIN_CSRF.to_string(),
                pkce_verifier: "verifier".to_string(),
                nonce: "nonce".to_string(),
                redirect: redirect.to_string(),
            },
        }
    }

    async fn redeem(
        &self,
        code: &str,
        _state: &LoginState,
    ) -> Result<SessionState, Report<ProviderError>> {
        if code != GOOD_CODE {
            return Err(ProviderError::Redeem {
                details: "invalid_grant".to_string(),
            }
            .into());
        }
        Ok(fresh_session())
    }

    async fn refresh(&self, _session: &SessionState) -> Result<SessionState, Report<ProviderError>> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_refresh {
            return Err(ProviderError::Refresh {
                details: "invalid_grant".to_string(),
            }
            .into());
        }
        Ok(SessionState::new(String::new(), Utc::now())
            .with_tokens(Some("refreshed-access".to_string()), None, None)
            .with_expires_on(Some(Utc::now() + ChronoDuration::hours(1))))
    }
}

/// Upstream that records the headers of the last request it served.
#[derive(Default)]
pub struct RecordingUpstream {
    last: Mutex<Option<HeaderMap>>,
}

impl RecordingUpstream {
    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.last.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Upstream for RecordingUpstream {
    async fn serve(&self, request: Request<Body>) -> Response {
        *self.last.lock().expect("lock") = Some(request.headers().clone());
        (StatusCode::OK, "upstream ok").into_response()
    }
}
