//! The per-request authentication pipeline.
//!
//! A [`Pipeline`] runs an ordered list of [`Stage`]s over one [`Exchange`].
//! Each stage may pass, attach or replace the request's session in the
//! [`RequestScope`], or end the chain with a response. When every stage has
//! passed, the session left in the scope is the verdict.

mod stages;

pub use stages::{BearerStage, DecisionStage, RefreshStage, ScopeStage, SessionStage};

use crate::error::PipelineError;
use async_trait::async_trait;
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use gatehouse_access::{BearerTokenAuthenticator, Provider};
use gatehouse_session::{RefreshCoordinator, RequestContext, SessionState, SessionStore};
use rootcause::prelude::Report;
use std::sync::Arc;
use tracing::{debug, error};

/// How the request's session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// Built from a verified token in the `Authorization` header.
    Bearer,
    /// Loaded from the session store.
    Store,
}

/// Mutable per-request state shared by the stages.
#[derive(Debug, Default)]
pub struct RequestScope {
    session: Option<(SessionState, SessionSource)>,
}

impl RequestScope {
    #[must_use]
    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref().map(|(session, _)| session)
    }

    #[must_use]
    pub fn source(&self) -> Option<SessionSource> {
        self.session.as_ref().map(|(_, source)| *source)
    }

    #[must_use]
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Attaches `session`, replacing any earlier one.
    pub fn attach(&mut self, session: SessionState, source: SessionSource) {
        self.session = Some((session, source));
    }

    /// Drops the session, if any.
    pub fn detach(&mut self) -> Option<SessionState> {
        self.session.take().map(|(session, _)| session)
    }

    fn take(&mut self) -> Option<(SessionState, SessionSource)> {
        self.session.take()
    }
}

/// One request travelling through the pipeline.
#[derive(Debug)]
pub struct Exchange {
    uri: Uri,
    headers: HeaderMap,
    cookies: RequestContext,
    scope: Option<RequestScope>,
}

impl Exchange {
    /// Wraps the request's URI and headers. The scope is attached by the
    /// first stage.
    #[must_use]
    pub fn new(uri: Uri, headers: HeaderMap) -> Self {
        let cookies = RequestContext::from_headers(&headers);
        Self {
            uri,
            headers,
            cookies,
            scope: None,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn cookies(&self) -> &RequestContext {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut RequestContext {
        &mut self.cookies
    }

    /// Attaches a fresh scope.
    pub fn begin_scope(&mut self) {
        self.scope = Some(RequestScope::default());
    }

    /// Returns the request scope.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::MissingScope` naming `stage` if no scope was
    /// attached.
    pub fn scope(&self, stage: &'static str) -> Result<&RequestScope, Report<PipelineError>> {
        self.scope
            .as_ref()
            .ok_or_else(|| PipelineError::MissingScope { stage }.into())
    }

    /// Returns the request scope for modification.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::MissingScope` naming `stage` if no scope was
    /// attached.
    pub fn scope_mut(
        &mut self,
        stage: &'static str,
    ) -> Result<&mut RequestScope, Report<PipelineError>> {
        self.scope
            .as_mut()
            .ok_or_else(|| PipelineError::MissingScope { stage }.into())
    }

    /// Returns the cookie changes the stages made.
    #[must_use]
    pub fn into_cookies(self) -> RequestContext {
        self.cookies
    }
}

/// What a stage tells the driver.
#[derive(Debug)]
pub enum Flow {
    /// Run the next stage.
    Continue,
    /// End the chain with this response.
    Respond(Response),
}

/// The pipeline's decision for one request.
#[derive(Debug)]
pub enum Verdict {
    /// Forward the request upstream as this identity.
    Authenticated {
        session: SessionState,
        source: SessionSource,
    },
    /// Answer the client directly.
    Respond(Response),
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name for logs and contract errors.
    fn name(&self) -> &'static str;

    async fn handle(&self, exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>>;
}

/// Runs stages in order until one responds or all have passed.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Composes the gateway's stages: scope, bearer (when `bearer` is
    /// given), session, refresh, decision.
    #[must_use]
    pub fn standard(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn Provider>,
        coordinator: RefreshCoordinator,
        bearer: Option<BearerTokenAuthenticator>,
    ) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = vec![Box::new(ScopeStage)];
        if let Some(authenticator) = bearer {
            stages.push(Box::new(BearerStage::new(authenticator)));
        }
        stages.push(Box::new(SessionStage::new(Arc::clone(&store))));
        stages.push(Box::new(RefreshStage::new(store, provider, coordinator)));
        stages.push(Box::new(DecisionStage::new(crate::auth::SIGN_IN_PATH)));
        Self::new(stages)
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Decides `exchange`. Contract violations and store outages become a
    /// 500 response.
    pub async fn run(&self, exchange: &mut Exchange) -> Verdict {
        match self.drive(exchange).await {
            Ok(verdict) => verdict,
            Err(report) => {
                error!(error = %report.current_context(), "request aborted");
                Verdict::Respond(report.current_context().clone().into_response())
            }
        }
    }

    async fn drive(&self, exchange: &mut Exchange) -> Result<Verdict, Report<PipelineError>> {
        for stage in &self.stages {
            match stage.handle(exchange).await? {
                Flow::Continue => {}
                Flow::Respond(response) => {
                    debug!(stage = stage.name(), status = %response.status(), "pipeline responded");
                    return Ok(Verdict::Respond(response));
                }
            }
        }

        match exchange.scope_mut("pipeline")?.take() {
            Some((session, source)) => Ok(Verdict::Authenticated { session, source }),
            None => Err(PipelineError::NoDecision.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use chrono::Utc;

    struct AttachStage;

    #[async_trait]
    impl Stage for AttachStage {
        fn name(&self) -> &'static str {
            "attach"
        }

        async fn handle(&self, exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>> {
            let session = SessionState::new("user-1", Utc::now())
                .with_tokens(Some("access".to_string()), None, None);
            exchange
                .scope_mut(self.name())?
                .attach(session, SessionSource::Store);
            Ok(Flow::Continue)
        }
    }

    struct TeapotStage;

    #[async_trait]
    impl Stage for TeapotStage {
        fn name(&self) -> &'static str {
            "teapot"
        }

        async fn handle(&self, _exchange: &mut Exchange) -> Result<Flow, Report<PipelineError>> {
            Ok(Flow::Respond(StatusCode::IM_A_TEAPOT.into_response()))
        }
    }

    fn exchange() -> Exchange {
        Exchange::new(Uri::from_static("/app"), HeaderMap::new())
    }

    fn status(verdict: Verdict) -> StatusCode {
        match verdict {
            Verdict::Respond(response) => response.status(),
            Verdict::Authenticated { .. } => StatusCode::OK,
        }
    }

    #[tokio::test]
    async fn stage_without_scope_aborts_request() {
        let pipeline = Pipeline::new(vec![Box::new(AttachStage)]);
        let verdict = pipeline.run(&mut exchange()).await;
        assert_eq!(status(verdict), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn finishing_without_session_fails_closed() {
        let pipeline = Pipeline::new(vec![Box::new(ScopeStage)]);
        let verdict = pipeline.run(&mut exchange()).await;
        assert_eq!(status(verdict), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn response_short_circuits_later_stages() {
        let pipeline = Pipeline::new(vec![
            Box::new(ScopeStage),
            Box::new(TeapotStage),
            Box::new(AttachStage),
        ]);
        let verdict = pipeline.run(&mut exchange()).await;
        assert_eq!(status(verdict), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn session_left_in_scope_is_the_verdict() {
        let pipeline = Pipeline::new(vec![Box::new(ScopeStage), Box::new(AttachStage)]);
        match pipeline.run(&mut exchange()).await {
            Verdict::Authenticated { session, source } => {
                assert_eq!(session.user(), "user-1");
                assert_eq!(source, SessionSource::Store);
            }
            Verdict::Respond(response) => panic!("unexpected response {}", response.status()),
        }
    }

    #[test]
    fn scope_tracks_source() {
        let mut scope = RequestScope::default();
        assert!(!scope.has_session());
        scope.attach(SessionState::new("u", Utc::now()), SessionSource::Bearer);
        assert_eq!(scope.source(), Some(SessionSource::Bearer));
        assert_eq!(scope.detach().map(|s| s.user().to_string()), Some("u".to_string()));
        assert!(scope.source().is_none());
    }
}
