//! Authentication routes for sign-in, callback, and sign-out.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use gatehouse_access::LoginState;
use gatehouse_session::{CookieOptions, RequestContext};
use serde::Deserialize;
use std::sync::Arc;
use time::Duration as TimeDuration;
use tracing::{info, warn};

use crate::app::AppState;

pub const SIGN_IN_PATH: &str = "/oauth2/sign_in";
pub const CALLBACK_PATH: &str = "/oauth2/callback";
pub const SIGN_OUT_PATH: &str = "/oauth2/sign_out";

/// Lifetime of the cookie holding an in-flight login.
const LOGIN_STATE_MINUTES: i64 = 10;

fn login_cookie_name(cookie: &CookieOptions) -> String {
    format!("{}_csrf", cookie.name)
}

/// Returns `rd` if it is a path on this site, otherwise `/`.
#[must_use]
pub fn safe_redirect(rd: Option<&str>) -> String {
    match rd {
        Some(rd)
            if rd.starts_with('/')
                && !rd.starts_with("//")
                && !rd.starts_with("/\\")
                && !rd.chars().any(char::is_control) =>
        {
            rd.to_string()
        }
        _ => "/".to_string(),
    }
}

fn encode_login_state(state: &LoginState) -> Result<String, AuthError> {
    let json = serde_json::to_vec(state).map_err(|_| AuthError::InvalidAuthState)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_login_state(value: &str) -> Result<LoginState, AuthError> {
    let json = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| AuthError::InvalidAuthState)?;
    serde_json::from_slice(&json).map_err(|_| AuthError::InvalidAuthState)
}

/// Query parameters for the sign-in route.
#[derive(Debug, Deserialize)]
pub struct SignInQuery {
    rd: Option<String>,
}

/// Query parameters for the OIDC callback.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: String,
    state: String,
}

/// Starts a login by redirecting to the identity provider.
pub async fn sign_in(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignInQuery>,
    jar: CookieJar,
) -> Result<impl IntoResponse, AuthError> {
    let redirect = safe_redirect(query.rd.as_deref());
    let login = state.provider.login_url(&redirect);

    // Keep the login state in a short-lived cookie for the callback
    let mut cookie = state.cookie.build(
        login_cookie_name(&state.cookie),
        encode_login_state(&login.state)?,
    );
    cookie.set_max_age(TimeDuration::minutes(LOGIN_STATE_MINUTES));

    Ok((jar.add(cookie), Redirect::to(&login.url)))
}

/// Handles the OIDC callback after the user authenticates with the identity provider.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    let mut ctx = RequestContext::from_headers(&headers);
    let login_name = login_cookie_name(&state.cookie);

    let login_state = ctx
        .cookie_value(&login_name)
        .ok_or(AuthError::MissingAuthState)
        .and_then(|value| decode_login_state(&value))?;

    if query.state != login_state.csrf_token {
        return Err(AuthError::CsrfMismatch);
    }

    let session = state
        .provider
        .redeem(&query.code, &login_state)
        .await
        .map_err(|report| AuthError::TokenExchange(report.current_context().to_string()))?;

    if !state.access.permits(session.groups()) {
        info!(user = session.user(), "sign-in refused for user outside allowed groups");
        return Err(AuthError::AccessDenied);
    }
    if !state.access.permits_email(session.email()) {
        info!(user = session.user(), "sign-in refused for email outside allowed domains");
        return Err(AuthError::AccessDenied);
    }

    // A fresh login never reuses the session the client arrived with
    if let Err(report) = state.store.clear(&mut ctx).await {
        warn!(error = %report.current_context(), "failed to clear previous session");
    }
    state
        .store
        .save(&mut ctx, &session)
        .await
        .map_err(|report| AuthError::Store(report.current_context().to_string()))?;
    ctx.remove_cookie(state.cookie.removal(login_name));

    info!(user = session.user(), "signed in");
    Ok((
        ctx.into_jar(),
        Redirect::to(&safe_redirect(Some(&login_state.redirect))),
    ))
}

/// Signs the user out by clearing their session.
pub async fn sign_out(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let mut ctx = RequestContext::from_headers(&headers);
    if let Err(report) = state.store.clear(&mut ctx).await {
        warn!(error = %report.current_context(), "failed to clear session on sign-out");
    }
    (ctx.into_jar(), Redirect::to("/"))
}

/// Authentication errors.
#[derive(Debug)]
pub enum AuthError {
    MissingAuthState,
    InvalidAuthState,
    CsrfMismatch,
    TokenExchange(String),
    AccessDenied,
    Store(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::MissingAuthState => (StatusCode::BAD_REQUEST, "Missing auth state"),
            Self::InvalidAuthState => (StatusCode::BAD_REQUEST, "Invalid auth state"),
            Self::CsrfMismatch => (StatusCode::BAD_REQUEST, "CSRF token mismatch"),
            Self::TokenExchange(msg) => {
                tracing::error!("Token exchange failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed")
            }
            Self::AccessDenied => (
                StatusCode::FORBIDDEN,
                "Access denied - you are not authorized to use this service",
            ),
            Self::Store(msg) => {
                tracing::error!("Session store error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, message).into_response()
    }
}
