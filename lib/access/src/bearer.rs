//! Bearer-token authentication.
//!
//! Turns the `Authorization` header of a request into a session when it
//! carries a JWT that one of the configured issuers vouches for.

use crate::error::BearerError;
use crate::oidc::ProviderConfig;
use crate::verifier::{IssuerVerifier, VerifiedClaims};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use gatehouse_session::SessionState;
use regex::Regex;
use rootcause::prelude::Report;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static JWT_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^eyJ[a-zA-Z0-9_-]*\.eyJ[a-zA-Z0-9_-]*\.[a-zA-Z0-9_-]+$").expect("valid regex")
});

/// Password that marks a Basic credential whose username is a token.
pub const BASIC_TOKEN_PASSWORD: &str = "x-oauth-basic";

/// Returns true if `candidate` has the shape of a compact JWT.
#[must_use]
pub fn looks_like_jwt(candidate: &str) -> bool {
    JWT_SHAPE.is_match(candidate)
}

/// Turns a verified token into a session.
pub type TokenToSession =
    Arc<dyn Fn(&str, &VerifiedClaims) -> Result<SessionState, Report<BearerError>> + Send + Sync>;

/// Default conversion: the token stands in for both the ID and the access
/// token, and the session expires with it.
///
/// # Errors
///
/// Returns `BearerError::Conversion` if the token has no email or the issuer
/// reports the email as unverified.
pub fn claims_to_session(
    raw_token: &str,
    claims: &VerifiedClaims,
) -> Result<SessionState, Report<BearerError>> {
    let email = claims
        .email
        .clone()
        .filter(|e| !e.is_empty())
        .ok_or(BearerError::Conversion {
            reason: "token has no email claim".to_string(),
        })?;
    if claims.email_verified == Some(false) {
        return Err(BearerError::Conversion {
            reason: "email in token is not verified".to_string(),
        }
        .into());
    }

    Ok(SessionState::new(claims.subject.clone(), Utc::now())
        .with_email(Some(email))
        .with_preferred_username(claims.preferred_username.clone())
        .with_tokens(
            Some(raw_token.to_string()),
            Some(raw_token.to_string()),
            None,
        )
        .with_expires_on(claims.expires_at)
        .with_groups(claims.groups.clone()))
}

/// [`claims_to_session`], additionally refusing emails outside the email
/// domains `policy` allows.
#[must_use]
pub fn domain_checked_claims_to_session(policy: &ProviderConfig) -> TokenToSession {
    let policy = policy.clone();
    Arc::new(move |raw_token, claims| {
        let session = claims_to_session(raw_token, claims)?;
        if !policy.permits_email(session.email()) {
            return Err(BearerError::Conversion {
                reason: "email domain is not allowed".to_string(),
            }
            .into());
        }
        Ok(session)
    })
}

/// A trusted issuer paired with the conversion for its tokens.
#[derive(Clone)]
pub struct TokenToSessionLoader {
    verifier: Arc<dyn IssuerVerifier>,
    converter: TokenToSession,
}

impl TokenToSessionLoader {
    /// Pairs `verifier` with [`claims_to_session`].
    #[must_use]
    pub fn new(verifier: Arc<dyn IssuerVerifier>) -> Self {
        Self {
            verifier,
            converter: Arc::new(claims_to_session),
        }
    }

    #[must_use]
    pub fn with_converter(verifier: Arc<dyn IssuerVerifier>, converter: TokenToSession) -> Self {
        Self {
            verifier,
            converter,
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        self.verifier.issuer()
    }
}

impl std::fmt::Debug for TokenToSessionLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenToSessionLoader")
            .field("issuer", &self.issuer())
            .finish_non_exhaustive()
    }
}

/// Authenticates requests by their `Authorization` header.
///
/// Loaders are consulted in order and the first verifier that accepts the
/// token decides the session.
#[derive(Debug, Clone, Default)]
pub struct BearerTokenAuthenticator {
    loaders: Vec<TokenToSessionLoader>,
}

impl BearerTokenAuthenticator {
    #[must_use]
    pub fn new(loaders: Vec<TokenToSessionLoader>) -> Self {
        Self { loaders }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Issuers in the order they are consulted.
    #[must_use]
    pub fn issuers(&self) -> Vec<&str> {
        self.loaders.iter().map(TokenToSessionLoader::issuer).collect()
    }

    /// Builds a session from the header value, if one was sent.
    ///
    /// Returns `Ok(None)` when there is no header at all.
    ///
    /// # Errors
    ///
    /// `MalformedHeader` or `NoBearerToken` when the header holds no usable
    /// candidate, `UntrustedToken` when no issuer accepts it, or the
    /// converter's error.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> Result<Option<SessionState>, Report<BearerError>> {
        let Some(header) = authorization.filter(|h| !h.is_empty()) else {
            return Ok(None);
        };
        let token = find_bearer_token(header)?;

        for loader in &self.loaders {
            match loader.verifier.verify(&token).await {
                Ok(claims) => return (loader.converter)(&token, &claims).map(Some),
                Err(report) => {
                    debug!(
                        issuer = loader.issuer(),
                        reason = %report.current_context(),
                        "issuer did not accept bearer token"
                    );
                }
            }
        }

        Err(BearerError::UntrustedToken {
            issuers_tried: self.loaders.len(),
        }
        .into())
    }
}

/// Extracts the candidate token from an `Authorization` header value.
///
/// The header splits at its first space; everything after it is the
/// credential. A Bearer credential with further spaces is not JWT-shaped, so
/// `"Bearer a b"` yields `NoBearerToken` rather than `MalformedHeader`.
///
/// # Errors
///
/// `MalformedHeader` when the header is not `scheme credential` or a Basic
/// credential does not decode; `NoBearerToken` when no JWT-shaped token is
/// present.
pub fn find_bearer_token(header: &str) -> Result<String, BearerError> {
    let (scheme, credential) = header.split_once(' ').ok_or(BearerError::MalformedHeader {
        reason: "expected a scheme and a credential",
    })?;

    match scheme {
        "Bearer" if looks_like_jwt(credential) => Ok(credential.to_string()),
        "Basic" => {
            let decoded = STANDARD
                .decode(credential)
                .map_err(|_| BearerError::MalformedHeader {
                    reason: "basic credential is not valid base64",
                })?;
            let decoded = String::from_utf8(decoded).map_err(|_| BearerError::MalformedHeader {
                reason: "basic credential is not valid UTF-8",
            })?;
            let (user, password) = decoded.split_once(':').ok_or(BearerError::MalformedHeader {
                reason: "basic credential has no separator",
            })?;

            if looks_like_jwt(user) {
                if password.is_empty() || password == BASIC_TOKEN_PASSWORD {
                    return Ok(user.to_string());
                }
            } else if looks_like_jwt(password) {
                return Ok(password.to_string());
            }
            Err(BearerError::NoBearerToken)
        }
        _ => Err(BearerError::NoBearerToken),
    }
}
