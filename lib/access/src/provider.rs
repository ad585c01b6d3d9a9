//! The identity provider collaborator.
//!
//! The gateway never speaks a provider's wire protocol directly; it asks a
//! [`Provider`] to start a login, to redeem the code the user comes back with,
//! and to refresh a session whose tokens are about to expire.

use crate::error::ProviderError;
use async_trait::async_trait;
use gatehouse_session::SessionState;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};

/// Values that must survive the round trip through the provider's login page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    /// CSRF token echoed back as the `state` query parameter.
    pub csrf_token: String,
    pub pkce_verifier: String,
    pub nonce: String,
    /// Where to send the user after a successful login.
    pub redirect: String,
}

/// A login to start: the provider URL to send the user to, and the state to
/// keep until the callback.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub url: String,
    pub state: LoginState,
}

/// An upstream identity provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Starts a login that returns the user to `redirect` on success.
    fn login_url(&self, redirect: &str) -> LoginRequest;

    /// Redeems an authorization code into a new session.
    async fn redeem(
        &self,
        code: &str,
        state: &LoginState,
    ) -> Result<SessionState, Report<ProviderError>>;

    /// Exchanges the session's refresh token for new tokens.
    ///
    /// Returns a replacement session; the input is not modified. Fields the
    /// provider does not return are left empty for the caller to merge.
    async fn refresh(&self, session: &SessionState) -> Result<SessionState, Report<ProviderError>>;

    /// Returns true if the provider may be asked to refresh `session`.
    fn can_refresh(&self, session: &SessionState) -> bool {
        session.refresh_token().is_some()
    }
}
