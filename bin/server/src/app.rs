//! Application state, start-up assembly, and the HTTP router.

use crate::auth::{
    self, CALLBACK_PATH, OidcProvider, SIGN_IN_PATH, SIGN_OUT_PATH, discover_verifier,
};
use crate::config::{HeaderConfig, HealthConfig, ServerConfig, StoreKind};
use crate::error::StartupError;
use crate::pipeline::{Exchange, Pipeline, Verdict};
use crate::upstream::{HttpUpstream, Upstream, apply_identity};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::USER_AGENT;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use gatehouse_access::{
    BearerTokenAuthenticator, Provider, ProviderConfig, TokenToSessionLoader,
    domain_checked_claims_to_session,
};
use gatehouse_session::{
    CookieOptions, CookieStore, MemoryBackend, PersistentStore, RedisBackend, RefreshCoordinator,
    SessionCodec, SessionStore,
};
use rootcause::prelude::Report;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub pipeline: Pipeline,
    pub store: Arc<dyn SessionStore>,
    pub provider: Arc<dyn Provider>,
    /// Sign-in policy of the identity provider.
    pub access: ProviderConfig,
    pub upstream: Arc<dyn Upstream>,
    pub cookie: CookieOptions,
    pub headers: HeaderConfig,
    pub health: HealthConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("pipeline", &self.pipeline)
            .field("store", &self.store.name())
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

const READINESS_PATH: &str = "/readiness_check";

/// Builds the router serving the auth endpoints and proxying everything else.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(SIGN_IN_PATH, get(auth::sign_in))
        .route(CALLBACK_PATH, get(auth::callback))
        .route(SIGN_OUT_PATH, get(auth::sign_out).post(auth::sign_out))
        .fallback(gateway)
        .layer(middleware::from_fn_with_state(Arc::clone(&state), health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Answers health checks by path or user agent, ahead of authentication.
///
/// The readiness path also requires the session store to respond.
async fn health_check(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    let by_path = state.health.paths().contains(&path);
    let by_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|agent| state.health.user_agents().contains(&agent));
    let readiness = by_path && path == READINESS_PATH;

    if !by_path && !by_agent {
        return next.run(request).await;
    }
    if readiness {
        if let Err(report) = state.store.verify_connection().await {
            warn!(store = state.store.name(), error = %report.current_context(), "not ready");
            return (StatusCode::SERVICE_UNAVAILABLE, "session store unavailable").into_response();
        }
    }
    "OK".into_response()
}

/// Authenticates a request and forwards it upstream.
async fn gateway(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let mut exchange = Exchange::new(parts.uri.clone(), parts.headers.clone());

    let verdict = state.pipeline.run(&mut exchange).await;
    let jar = exchange.into_cookies().into_jar();

    let response = match verdict {
        Verdict::Respond(response) => response,
        Verdict::Authenticated { session, source } => {
            debug!(user = session.user(), ?source, "forwarding authenticated request");
            apply_identity(&mut parts.headers, &session, &state.headers);
            state.upstream.serve(Request::from_parts(parts, body)).await
        }
    };

    (jar, response).into_response()
}

async fn build_store(
    config: &ServerConfig,
) -> Result<Arc<dyn SessionStore>, Report<StartupError>> {
    let session = &config.session;
    let store: Arc<dyn SessionStore> = match session.store {
        StoreKind::Cookie => {
            let codec = SessionCodec::from_secret(&config.cookie_secret).map_err(|report| {
                report.context(StartupError::Configuration {
                    details: "cookie_secret is unusable".to_string(),
                })
            })?;
            Arc::new(
                CookieStore::new(codec, config.cookie.clone())
                    .map_err(|report| report.context(StartupError::Store))?,
            )
        }
        StoreKind::Redis => {
            let backend = RedisBackend::connect(&session.redis)
                .await
                .map_err(|report| report.context(StartupError::Store))?;
            Arc::new(PersistentStore::new(
                Arc::new(backend),
                config.cookie.clone(),
                session.redis.key_prefix.clone(),
                session.store_timeout(),
            ))
        }
        StoreKind::Memory => {
            warn!("using in-process session store; sessions are lost on restart");
            Arc::new(PersistentStore::new(
                Arc::new(MemoryBackend::new()),
                config.cookie.clone(),
                session.redis.key_prefix.clone(),
                session.store_timeout(),
            ))
        }
    };

    store
        .verify_connection()
        .await
        .map_err(|report| report.context(StartupError::Store))?;
    info!(store = store.name(), "session store ready");
    Ok(store)
}

async fn build_bearer(
    config: &ServerConfig,
    provider: &OidcProvider,
) -> Result<Option<BearerTokenAuthenticator>, Report<StartupError>> {
    if !config.bearer.skip_jwt_bearer_tokens {
        return Ok(None);
    }

    let primary = provider
        .verifier()
        .map_err(|report| report.context(StartupError::Provider))?;
    let converter = domain_checked_claims_to_session(&config.oidc);
    let mut loaders = vec![TokenToSessionLoader::with_converter(
        Arc::new(primary),
        Arc::clone(&converter),
    )];

    for (issuer, audience) in config.bearer.extra_issuers() {
        let verifier = discover_verifier(&issuer, &audience, config.oidc.groups_claim())
            .await
            .map_err(|report| report.context(StartupError::Provider))?;
        loaders.push(TokenToSessionLoader::with_converter(
            Arc::new(verifier),
            Arc::clone(&converter),
        ));
    }

    let authenticator = BearerTokenAuthenticator::new(loaders);
    info!(issuers = ?authenticator.issuers(), "bearer tokens accepted");
    Ok(Some(authenticator))
}

/// Assembles the gateway from its configuration.
///
/// # Errors
///
/// Returns a `StartupError` if the store, the identity provider, or the
/// upstream cannot be set up.
pub async fn build_state(config: &ServerConfig) -> Result<AppState, Report<StartupError>> {
    let store = build_store(config).await?;

    info!(issuer = config.oidc.issuer_url(), "discovering OIDC provider");
    let oidc = OidcProvider::discover(config.oidc.clone())
        .await
        .map_err(|report| report.context(StartupError::Provider))?;
    let bearer = build_bearer(config, &oidc).await?;
    let provider: Arc<dyn Provider> = Arc::new(oidc);

    let upstream = HttpUpstream::new(&config.upstream_url)?;
    let coordinator = RefreshCoordinator::new(config.session.refresh.clone());
    let pipeline = Pipeline::standard(
        Arc::clone(&store),
        Arc::clone(&provider),
        coordinator,
        bearer,
    );

    Ok(AppState {
        pipeline,
        store,
        provider,
        access: config.oidc.clone(),
        upstream: Arc::new(upstream),
        cookie: config.cookie.clone(),
        headers: config.headers.clone(),
        health: config.health.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        CountingStore, GOOD_CODE, LOGIN_CSRF, RecordingUpstream, StaticProvider, cookie_store,
    };
    use gatehouse_access::ProviderConfigBuilder;
    use gatehouse_session::{RefreshConfig, context::is_removal};
    use axum::body::Body;
    use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum_extra::extract::cookie::Cookie;
    use tower::ServiceExt;

    fn access(allowed: &[&str]) -> ProviderConfig {
        ProviderConfigBuilder::new(
            "https://idp.example.com".to_string(),
            "gatehouse".to_string(),
            "secret".to_string(),
            "https://gate.example.com/oauth2/callback".to_string(),
        )
        .allowed_groups(allowed)
        .build()
    }

    fn test_state(access: ProviderConfig) -> (Arc<AppState>, Arc<RecordingUpstream>) {
        test_state_with(access, HealthConfig::default(), cookie_store())
    }

    fn test_state_with(
        access: ProviderConfig,
        health: HealthConfig,
        store: Arc<dyn SessionStore>,
    ) -> (Arc<AppState>, Arc<RecordingUpstream>) {
        let provider: Arc<dyn Provider> = Arc::new(StaticProvider::succeeding());
        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = Pipeline::standard(
            Arc::clone(&store),
            Arc::clone(&provider),
            RefreshCoordinator::new(RefreshConfig::default()),
            None,
        );
        let state = AppState {
            pipeline,
            store,
            provider,
            access,
            upstream: upstream.clone(),
            cookie: CookieOptions::default(),
            headers: HeaderConfig::default(),
            health,
        };
        (Arc::new(state), upstream)
    }

    fn get(uri: &str, cookies: &str) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if !cookies.is_empty() {
            builder = builder.header(COOKIE, cookies);
        }
        builder.body(Body::empty()).expect("request")
    }

    /// Collects the cookies a response sets into a `Cookie` header value.
    fn cookies_set(response: &Response) -> String {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| Cookie::parse(value.to_string()).ok())
            .filter(|cookie| !is_removal(cookie))
            .map(|cookie| format!("{}={}", cookie.name(), cookie.value()))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .expect("location")
    }

    async fn sign_in_cookies(state: &Arc<AppState>, rd: &str) -> String {
        let response = router(state.clone())
            .oneshot(get(&format!("/oauth2/sign_in?rd={rd}"), ""))
            .await
            .expect("sign in");
        cookies_set(&response)
    }

    #[tokio::test]
    async fn ping_answers_without_a_session() {
        let (state, upstream) = test_state(access(&[]));
        let response = router(state).oneshot(get("/ping", "")).await.expect("ping");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(upstream.last_headers().is_none());
    }

    #[tokio::test]
    async fn health_checks_match_paths_and_user_agents() {
        let health = HealthConfig {
            ping_user_agent: "kube-probe/1.30".to_string(),
            gcp_health_checks: true,
            ..HealthConfig::default()
        };
        let (state, upstream) = test_state_with(access(&[]), health, cookie_store());

        for path in ["/ping", "/liveness_check", "/readiness_check"] {
            let response = router(state.clone()).oneshot(get(path, "")).await.expect("health");
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }
        for agent in ["kube-probe/1.30", "GoogleHC/1.0"] {
            let request = HttpRequest::builder()
                .uri("/app")
                .header("user-agent", agent)
                .body(Body::empty())
                .expect("request");
            let response = router(state.clone()).oneshot(request).await.expect("health");
            assert_eq!(response.status(), StatusCode::OK, "{agent}");
        }
        assert!(upstream.last_headers().is_none());

        let request = HttpRequest::builder()
            .uri("/app")
            .header("user-agent", "curl/8.0")
            .header("accept", "text/html")
            .body(Body::empty())
            .expect("request");
        let response = router(state).oneshot(request).await.expect("gateway");
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn gcp_paths_are_proxied_unless_enabled() {
        let (state, _) = test_state(access(&[]));
        let response = router(state)
            .oneshot(get("/liveness_check", ""))
            .await
            .expect("gateway");
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn readiness_fails_while_store_is_unreachable() {
        let health = HealthConfig {
            gcp_health_checks: true,
            ..HealthConfig::default()
        };
        let (state, _) = test_state_with(
            access(&[]),
            health,
            Arc::new(CountingStore::new(cookie_store()).unreachable()),
        );

        let response = router(state.clone())
            .oneshot(get("/readiness_check", ""))
            .await
            .expect("readiness");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = router(state)
            .oneshot(get("/liveness_check", ""))
            .await
            .expect("liveness");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn anonymous_browser_request_is_sent_to_sign_in() {
        let (state, upstream) = test_state(access(&[]));
        let request = HttpRequest::builder()
            .uri("/app")
            .header("accept", "text/html")
            .body(Body::empty())
            .expect("request");
        let response = router(state).oneshot(request).await.expect("gateway");

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/oauth2/sign_in?rd=%2Fapp");
        assert!(upstream.last_headers().is_none());
    }

    #[tokio::test]
    async fn sign_in_stores_login_state_and_redirects_to_provider() {
        let (state, _) = test_state(access(&[]));
        let response = router(state)
            .oneshot(get("/oauth2/sign_in?rd=/app", ""))
            .await
            .expect("sign in");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(location(&response).starts_with("https://idp.example.com/authorize"));
        assert!(cookies_set(&response).starts_with("_gatehouse_csrf="));
    }

    #[tokio::test]
    async fn callback_creates_a_session_used_by_the_gateway() {
        let (state, upstream) = test_state(access(&[]));
        let login = sign_in_cookies(&state, "/app").await;

        let response = router(state.clone())
            .oneshot(get(
                &format!("/oauth2/callback?code={GOOD_CODE}&state={LOGIN_CSRF}"),
                &login,
            ))
            .await
            .expect("callback");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/app");

        let session = cookies_set(&response);
        assert!(session.contains("_gatehouse="));
        assert!(!session.contains("_gatehouse_csrf"));

        let request = HttpRequest::builder()
            .uri("/app")
            .header(COOKIE, session)
            .header("x-forwarded-user", "mallory")
            .body(Body::empty())
            .expect("request");
        let response = router(state).oneshot(request).await.expect("gateway");
        assert_eq!(response.status(), StatusCode::OK);

        let seen = upstream.last_headers().expect("upstream called");
        let users: Vec<_> = seen.get_all("x-forwarded-user").iter().collect();
        assert_eq!(users, vec!["user-1"]);
    }

    #[tokio::test]
    async fn callback_rejects_mismatched_state() {
        let (state, _) = test_state(access(&[]));
        let login = sign_in_cookies(&state, "/app").await;

        let response = router(state)
            .oneshot(get(
                &format!("/oauth2/callback?code={GOOD_CODE}&state=forged"),
                &login,
            ))
            .await
            .expect("callback");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(cookies_set(&response).is_empty());
    }

    #[tokio::test]
    async fn callback_without_login_cookie_is_rejected() {
        let (state, _) = test_state(access(&[]));
        let response = router(state)
            .oneshot(get(
                &format!("/oauth2/callback?code={GOOD_CODE}&state={LOGIN_CSRF}"),
                "",
            ))
            .await
            .expect("callback");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn users_outside_allowed_groups_are_refused() {
        let (state, _) = test_state(access(&["admins"]));
        let login = sign_in_cookies(&state, "/app").await;

        let response = router(state)
            .oneshot(get(
                &format!("/oauth2/callback?code={GOOD_CODE}&state={LOGIN_CSRF}"),
                &login,
            ))
            .await
            .expect("callback");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!cookies_set(&response).contains("_gatehouse="));
    }

    #[tokio::test]
    async fn users_outside_allowed_email_domains_are_refused() {
        let policy = ProviderConfigBuilder::new(
            "https://idp.example.com".to_string(),
            "gatehouse".to_string(),
            "secret".to_string(),
            "https://gate.example.com/oauth2/callback".to_string(),
        )
        .email_domains(&["corp.example.org"])
        .build();
        let (state, _) = test_state(policy);
        let login = sign_in_cookies(&state, "/app").await;

        let response = router(state)
            .oneshot(get(
                &format!("/oauth2/callback?code={GOOD_CODE}&state={LOGIN_CSRF}"),
                &login,
            ))
            .await
            .expect("callback");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!cookies_set(&response).contains("_gatehouse="));
    }

    #[tokio::test]
    async fn sign_out_clears_the_session() {
        let (state, _) = test_state(access(&[]));
        let login = sign_in_cookies(&state, "/").await;
        let response = router(state.clone())
            .oneshot(get(
                &format!("/oauth2/callback?code={GOOD_CODE}&state={LOGIN_CSRF}"),
                &login,
            ))
            .await
            .expect("callback");
        let session = cookies_set(&response);

        let response = router(state)
            .oneshot(get("/oauth2/sign_out", &session))
            .await
            .expect("sign out");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let removed: Vec<_> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| Cookie::parse(value.to_string()).ok())
            .filter(|cookie| is_removal(cookie))
            .map(|cookie| cookie.name().to_string())
            .collect();
        assert!(removed.contains(&"_gatehouse".to_string()));
    }
}
