//! The gateway's pipeline stages, in the order they run.

use super::{Exchange, Flow, SessionSource, Stage};
use crate::error::PipelineError;
use async_trait::async_trait;
use axum::http::header::{ACCEPT, AUTHORIZATION, LOCATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use gatehouse_access::{BearerTokenAuthenticator, Provider};
use gatehouse_session::{
    RefreshCoordinator, RefreshError, RefreshOutcome, SessionState, SessionStore,
};
use rootcause::prelude::Report;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attaches the empty request scope every later stage works in.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeStage;

#[async_trait]
impl Stage for ScopeStage {
    fn name(&self) -> &'static str {
        "scope"
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>> {
        exchange.begin_scope();
        Ok(Flow::Continue)
    }
}

/// Authenticates the request from its `Authorization` header.
///
/// A failed attempt is logged and the request falls through to the session
/// store.
#[derive(Debug)]
pub struct BearerStage {
    authenticator: BearerTokenAuthenticator,
}

impl BearerStage {
    #[must_use]
    pub fn new(authenticator: BearerTokenAuthenticator) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl Stage for BearerStage {
    fn name(&self) -> &'static str {
        "bearer"
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>> {
        if exchange.scope(self.name())?.has_session() {
            return Ok(Flow::Continue);
        }

        let header = match exchange.headers().get(AUTHORIZATION).map(|v| v.to_str()) {
            None => None,
            Some(Ok(value)) => Some(value.to_string()),
            Some(Err(_)) => {
                info!("ignoring authorization header that is not visible ASCII");
                None
            }
        };

        match self.authenticator.authenticate(header.as_deref()).await {
            Ok(Some(session)) => {
                debug!(user = session.user(), "authenticated by bearer token");
                exchange
                    .scope_mut(self.name())?
                    .attach(session, SessionSource::Bearer);
            }
            Ok(None) => {}
            Err(report) if report.current_context().is_absent() => {
                debug!(reason = %report.current_context(), "no bearer token in request");
            }
            Err(report) => {
                info!(reason = %report.current_context(), "bearer token not accepted");
            }
        }
        Ok(Flow::Continue)
    }
}

/// Loads the session the client's cookies point at.
pub struct SessionStage {
    store: Arc<dyn SessionStore>,
}

impl SessionStage {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

impl std::fmt::Debug for SessionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStage")
            .field("store", &self.store.name())
            .finish()
    }
}

#[async_trait]
impl Stage for SessionStage {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>> {
        if exchange.scope(self.name())?.has_session() {
            return Ok(Flow::Continue);
        }
        if exchange.cookies().incoming_names().next().is_none() {
            return Ok(Flow::Continue);
        }

        match self.store.load(exchange.cookies()).await {
            Ok(Some(session)) => {
                exchange
                    .scope_mut(self.name())?
                    .attach(session, SessionSource::Store);
            }
            Ok(None) => {}
            Err(report) if report.current_context().is_corrupt() => {
                info!(
                    store = self.store.name(),
                    reason = %report.current_context(),
                    "treating unreadable session as absent"
                );
            }
            Err(report) => {
                let details = report.current_context().to_string();
                return Err(report.context(PipelineError::StoreUnavailable { details }));
            }
        }
        Ok(Flow::Continue)
    }
}

/// Refreshes a stored session that has expired or is about to.
///
/// Bearer sessions are never refreshed.
pub struct RefreshStage {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn Provider>,
    coordinator: RefreshCoordinator,
}

impl RefreshStage {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn Provider>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            store,
            provider,
            coordinator,
        }
    }

    /// Drops the session from the request and from the store.
    async fn discard(&self, exchange: &mut Exchange) -> Result<(), Report<PipelineError>> {
        exchange.scope_mut(self.name())?.detach();
        if let Err(report) = self.store.clear(exchange.cookies_mut()).await {
            warn!(
                store = self.store.name(),
                error = %report.current_context(),
                "failed to clear session"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for RefreshStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshStage")
            .field("store", &self.store.name())
            .field("provider", &self.provider.name())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

#[async_trait]
impl Stage for RefreshStage {
    fn name(&self) -> &'static str {
        "refresh"
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>> {
        let scope = exchange.scope(self.name())?;
        if scope.source() != Some(SessionSource::Store) {
            return Ok(Flow::Continue);
        }
        let Some(session) = scope.session().cloned() else {
            return Ok(Flow::Continue);
        };
        if !self.coordinator.needs_refresh(&session) {
            return Ok(Flow::Continue);
        }

        if !self.provider.can_refresh(&session) {
            if session.is_expired_at(Utc::now()) {
                info!(user = session.user(), "session expired and cannot be refreshed");
                self.discard(exchange).await?;
            }
            return Ok(Flow::Continue);
        }

        let provider = Arc::clone(&self.provider);
        let outcome = self
            .coordinator
            .refresh(
                self.store.as_ref(),
                exchange.cookies_mut(),
                &session,
                move |current: SessionState| async move {
                    provider.refresh(&current).await.map_err(|report| {
                        let reason = report.current_context().to_string();
                        report.context(RefreshError::ProviderRejected { reason })
                    })
                },
            )
            .await;

        match outcome {
            Ok(RefreshOutcome::Refreshed(refreshed) | RefreshOutcome::Reloaded(refreshed)) => {
                exchange
                    .scope_mut(self.name())?
                    .attach(refreshed, SessionSource::Store);
            }
            Ok(RefreshOutcome::Gone) => {
                info!(user = session.user(), "session removed during refresh");
                self.discard(exchange).await?;
            }
            Ok(RefreshOutcome::Unavailable) => {
                exchange.scope_mut(self.name())?.detach();
            }
            Err(report) => match report.current_context() {
                RefreshError::ProviderRejected { .. } => {
                    warn!(
                        user = session.user(),
                        error = %report.current_context(),
                        "clearing session after failed refresh"
                    );
                    self.discard(exchange).await?;
                }
                RefreshError::Store => {
                    warn!(
                        user = session.user(),
                        error = %report.current_context(),
                        "refresh lock unavailable"
                    );
                    exchange.scope_mut(self.name())?.detach();
                }
            },
        }
        Ok(Flow::Continue)
    }
}

/// Rejects requests that reach the end of the chain without a session.
#[derive(Debug, Clone)]
pub struct DecisionStage {
    sign_in_path: String,
}

impl DecisionStage {
    #[must_use]
    pub fn new(sign_in_path: impl Into<String>) -> Self {
        Self {
            sign_in_path: sign_in_path.into(),
        }
    }

    fn sign_in_location(&self, uri: &Uri) -> String {
        let redirect = uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), ToString::to_string);
        match reqwest::Url::parse_with_params(
            &format!("http://gatehouse.invalid{}", self.sign_in_path),
            &[("rd", redirect)],
        ) {
            Ok(url) => format!("{}?{}", url.path(), url.query().unwrap_or_default()),
            Err(_) => self.sign_in_path.clone(),
        }
    }
}

/// Returns true if the client can follow a login redirect: it sent no
/// credentials of its own and accepts HTML.
fn wants_login_redirect(headers: &HeaderMap) -> bool {
    if headers.contains_key(AUTHORIZATION) {
        return false;
    }
    let accepted: Vec<&str> = headers
        .get_all(ACCEPT)
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    accepted.is_empty()
        || accepted
            .iter()
            .any(|v| v.contains("text/html") || v.contains("*/*"))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Bearer")],
        "Unauthorized",
    )
        .into_response()
}

#[async_trait]
impl Stage for DecisionStage {
    fn name(&self) -> &'static str {
        "decision"
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>> {
        if exchange.scope(self.name())?.has_session() {
            return Ok(Flow::Continue);
        }

        if !wants_login_redirect(exchange.headers()) {
            return Ok(Flow::Respond(unauthorized()));
        }
        let location = self.sign_in_location(exchange.uri());
        Ok(Flow::Respond(
            (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
        ))
    }
}
