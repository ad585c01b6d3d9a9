//! OIDC provider implementation using the openidconnect crate.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use gatehouse_access::{
    JwtVerifier, LoginRequest, LoginState, Provider, ProviderConfig, ProviderError, VerifiedClaims,
};
use gatehouse_session::SessionState;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use openidconnect::core::{
    CoreAuthenticationFlow, CoreClient, CoreIdTokenClaims, CoreProviderMetadata,
    CoreTokenResponse,
};
use openidconnect::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointMaybeSet, EndpointNotSet,
    EndpointSet, IssuerUrl, Nonce, OAuth2TokenResponse, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, RefreshToken, Scope, TokenResponse,
};
use rootcause::prelude::Report;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

type DiscoveredClient = CoreClient<
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointMaybeSet,
    EndpointMaybeSet,
>;

/// OIDC identity provider.
pub struct OidcProvider {
    provider_metadata: CoreProviderMetadata,
    client_id: ClientId,
    client_secret: ClientSecret,
    redirect_url: RedirectUrl,
    config: ProviderConfig,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcProvider")
            .field("issuer", &self.config.issuer_url())
            .field("client_id", &self.config.client_id())
            .finish_non_exhaustive()
    }
}

fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ProviderError::Configuration {
            details: format!("failed to create HTTP client: {e}"),
        })
}

async fn bounded<T>(
    budget: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, Report<ProviderError>>>,
) -> Result<T, Report<ProviderError>> {
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| ProviderError::Timeout { operation })?
}

async fn discover_metadata(
    issuer: &str,
    http_client: &reqwest::Client,
) -> Result<CoreProviderMetadata, ProviderError> {
    let issuer_url = IssuerUrl::new(issuer.to_string()).map_err(|e| {
        ProviderError::Configuration {
            details: format!("invalid issuer URL: {e}"),
        }
    })?;
    CoreProviderMetadata::discover_async(issuer_url, http_client)
        .await
        .map_err(|e| ProviderError::Discovery {
            details: format!("failed to discover {issuer}: {e}"),
        })
}

/// Converts a provider's key set into verification keys, skipping keys
/// that cannot be read.
fn verification_keys(jwks: &Value) -> JwkSet {
    let keys = jwks
        .get("keys")
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(|key| match serde_json::from_value::<Jwk>(key.clone()) {
                    Ok(jwk) => Some(jwk),
                    Err(e) => {
                        debug!(error = %e, "skipping unreadable JWKS entry");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    JwkSet { keys }
}

fn verifier_from_metadata(
    metadata: &CoreProviderMetadata,
    issuer: &str,
    audience: &str,
    groups_claim: &str,
) -> Result<JwtVerifier, ProviderError> {
    let jwks = serde_json::to_value(metadata.jwks()).map_err(|e| ProviderError::Discovery {
        details: format!("unreadable key set for {issuer}: {e}"),
    })?;
    Ok(JwtVerifier::new(issuer)
        .with_audiences(vec![audience.to_string()])
        .with_jwks(&verification_keys(&jwks))
        .with_groups_claim(groups_claim))
}

/// Builds a bearer-token verifier for an additional issuer from its
/// discovery document.
///
/// # Errors
///
/// Returns `ProviderError::Discovery` if the issuer cannot be discovered.
#[instrument(skip(groups_claim))]
pub async fn discover_verifier(
    issuer: &str,
    audience: &str,
    groups_claim: &str,
) -> Result<JwtVerifier, Report<ProviderError>> {
    let client = http_client()?;
    let metadata = discover_metadata(issuer, &client).await?;
    Ok(verifier_from_metadata(&metadata, issuer, audience, groups_claim)?)
}

/// Reads the raw ID token from a token response.
fn raw_id_token(token_response: &CoreTokenResponse) -> Option<String> {
    serde_json::to_value(token_response)
        .ok()?
        .get("id_token")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Decodes the payload of an already verified ID token, to read claims
/// outside the standard set.
fn id_token_payload(raw: &str) -> Option<Value> {
    let payload = raw.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn scopes_to_request(config: &ProviderConfig) -> Vec<String> {
    // The openid scope is always sent by the authorization request builder.
    config
        .scopes()
        .into_iter()
        .filter(|scope| *scope != "openid")
        .map(str::to_string)
        .collect()
}

impl OidcProvider {
    /// Creates a provider by discovering the issuer's metadata.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Configuration` for unusable URLs and
    /// `ProviderError::Discovery` if discovery fails or times out.
    pub async fn discover(config: ProviderConfig) -> Result<Self, Report<ProviderError>> {
        let http_client = http_client()?;
        let provider_metadata = bounded(config.timeout(), "discovery", async {
            discover_metadata(config.issuer_url(), &http_client)
                .await
                .map_err(Report::from)
        })
        .await?;

        let redirect_url = RedirectUrl::new(config.redirect_uri().to_string()).map_err(|e| {
            ProviderError::Configuration {
                details: format!("invalid redirect URI: {e}"),
            }
        })?;

        info!(issuer = config.issuer_url(), "discovered OIDC provider");
        Ok(Self {
            provider_metadata,
            client_id: ClientId::new(config.client_id().to_string()),
            client_secret: ClientSecret::new(config.client_secret().to_string()),
            redirect_url,
            config,
            http_client,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Builds the bearer-token verifier for this provider's own tokens,
    /// with the client id as audience.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Discovery` if the key set cannot be read.
    pub fn verifier(&self) -> Result<JwtVerifier, Report<ProviderError>> {
        Ok(verifier_from_metadata(
            &self.provider_metadata,
            self.config.issuer_url(),
            self.config.client_id(),
            self.config.groups_claim(),
        )?)
    }

    fn client(&self) -> DiscoveredClient {
        CoreClient::from_provider_metadata(
            self.provider_metadata.clone(),
            self.client_id.clone(),
            Some(self.client_secret.clone()),
        )
        .set_redirect_uri(self.redirect_url.clone())
    }

    /// Builds a session from a token response whose ID token, if any, has
    /// been verified as `claims`.
    fn session_from_tokens(
        &self,
        token_response: &CoreTokenResponse,
        claims: Option<&CoreIdTokenClaims>,
    ) -> Result<SessionState, ProviderError> {
        let now = Utc::now();
        let raw_id = raw_id_token(token_response);

        let groups = match raw_id.as_deref().and_then(id_token_payload) {
            Some(payload) => VerifiedClaims::from_value(payload, self.config.groups_claim())
                .map(|verified| verified.groups)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let expires_on = token_response
            .expires_in()
            .and_then(|lifetime| chrono::Duration::from_std(lifetime).ok())
            .map(|lifetime| now + lifetime)
            .or_else(|| claims.map(|c| c.expiration()));

        let (user, email, preferred_username) = match claims {
            Some(claims) => {
                if claims.email_verified() == Some(false) {
                    return Err(ProviderError::Redeem {
                        details: "email is not verified".to_string(),
                    });
                }
                (
                    claims.subject().as_str().to_string(),
                    claims.email().map(|e| e.as_str().to_string()),
                    claims.preferred_username().map(|u| u.as_str().to_string()),
                )
            }
            None => (String::new(), None, None),
        };

        Ok(SessionState::new(user, now)
            .with_email(email)
            .with_preferred_username(preferred_username)
            .with_tokens(
                Some(token_response.access_token().secret().clone()),
                raw_id,
                token_response.refresh_token().map(|t| t.secret().clone()),
            )
            .with_expires_on(expires_on)
            .with_groups(groups))
    }

    async fn redeem_code(
        &self,
        code: &str,
        state: &LoginState,
    ) -> Result<SessionState, Report<ProviderError>> {
        let client = self.client();
        let token_request = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .map_err(|e| ProviderError::Configuration {
                details: format!("token endpoint error: {e}"),
            })?;

        let token_response = token_request
            .set_pkce_verifier(PkceCodeVerifier::new(state.pkce_verifier.clone()))
            .request_async(&self.http_client)
            .await
            .map_err(|e| ProviderError::Redeem {
                details: format!("token exchange failed: {e}"),
            })?;

        let id_token = token_response.id_token().ok_or(ProviderError::Redeem {
            details: "no ID token in response".to_string(),
        })?;
        let nonce = Nonce::new(state.nonce.clone());
        let claims = id_token
            .claims(&client.id_token_verifier(), &nonce)
            .map_err(|e| ProviderError::Redeem {
                details: format!("ID token validation failed: {e}"),
            })?;

        Ok(self.session_from_tokens(&token_response, Some(claims))?)
    }

    async fn refresh_tokens(
        &self,
        session: &SessionState,
    ) -> Result<SessionState, Report<ProviderError>> {
        let refresh_token = session.refresh_token().ok_or(ProviderError::Refresh {
            details: "session has no refresh token".to_string(),
        })?;

        let client = self.client();
        let token_response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .map_err(|e| ProviderError::Configuration {
                details: format!("token endpoint error: {e}"),
            })?
            .request_async(&self.http_client)
            .await
            .map_err(|e| ProviderError::Refresh {
                details: format!("refresh request failed: {e}"),
            })?;

        // Refresh responses carry no nonce.
        let claims = match token_response.id_token() {
            Some(id_token) => Some(
                id_token
                    .claims(
                        &client.id_token_verifier(),
                        |_: Option<&Nonce>| -> Result<(), String> { Ok(()) },
                    )
                    .map_err(|e| ProviderError::Refresh {
                        details: format!("refreshed ID token validation failed: {e}"),
                    })?,
            ),
            None => None,
        };

        self.session_from_tokens(&token_response, claims)
            .map_err(|e| match e {
                ProviderError::Redeem { details } => ProviderError::Refresh { details },
                other => other,
            })
            .map_err(Report::from)
    }
}

#[async_trait]
impl Provider for OidcProvider {
    fn name(&self) -> &str {
        "oidc"
    }

    fn login_url(&self, redirect: &str) -> LoginRequest {
        let client = self.client();
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut auth_request = client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                CsrfToken::new_random,
                Nonce::new_random,
            )
            .set_pkce_challenge(pkce_challenge);

        for scope in scopes_to_request(&self.config) {
            auth_request = auth_request.add_scope(Scope::new(scope));
        }

        let (auth_url, csrf_token, nonce) = auth_request.url();

        LoginRequest {
            url: auth_url.to_string(),
            state: LoginState {
                csrf_token: csrf_token.secret().clone(),
                pkce_verifier: pkce_verifier.secret().clone(),
                nonce: nonce.secret().clone(),
                redirect: redirect.to_string(),
            },
        }
    }

    #[instrument(skip_all)]
    async fn redeem(
        &self,
        code: &str,
        state: &LoginState,
    ) -> Result<SessionState, Report<ProviderError>> {
        let session = bounded(self.config.timeout(), "redeem", self.redeem_code(code, state)).await?;
        debug!(user = session.user(), "redeemed authorization code");
        Ok(session)
    }

    #[instrument(skip_all, fields(user = session.user()))]
    async fn refresh(&self, session: &SessionState) -> Result<SessionState, Report<ProviderError>> {
        let refreshed = bounded(self.config.timeout(), "refresh", self.refresh_tokens(session))
            .await
            .inspect_err(|report| warn!(error = %report.current_context(), "refresh failed"))?;
        Ok(refreshed)
    }
}
