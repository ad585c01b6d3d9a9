//! Issuer verifiers for bearer tokens.

use crate::error::VerifyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use rootcause::prelude::Report;
use serde_json::Value;
use tracing::{debug, warn};

/// Claims of a token one issuer has vouched for.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims {
    pub subject: String,
    pub issuer: String,
    pub email: Option<String>,
    /// `None` when the issuer does not say.
    pub email_verified: Option<bool>,
    pub preferred_username: Option<String>,
    pub groups: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// The full claim set.
    pub raw: Value,
}

impl VerifiedClaims {
    /// Extracts the standard claims from a decoded claim set.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError::Rejected` if `sub` or `iss` is missing.
    pub fn from_value(raw: Value, groups_claim: &str) -> Result<Self, VerifyError> {
        let text = |name: &str| raw.get(name).and_then(Value::as_str).map(str::to_string);

        let subject = text("sub").filter(|s| !s.is_empty()).ok_or(VerifyError::Rejected {
            reason: "token has no subject".to_string(),
        })?;
        let issuer = text("iss").ok_or(VerifyError::Rejected {
            reason: "token has no issuer".to_string(),
        })?;

        // Some issuers send a single group as a bare string.
        let groups = match raw.get(groups_claim) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(group)) => vec![group.clone()],
            _ => Vec::new(),
        };

        let expires_at = raw
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|exp| DateTime::from_timestamp(exp, 0));

        Ok(Self {
            email: text("email"),
            email_verified: raw.get("email_verified").and_then(Value::as_bool),
            preferred_username: text("preferred_username"),
            subject,
            issuer,
            groups,
            expires_at,
            raw,
        })
    }
}

/// Checks tokens against one trusted issuer.
#[async_trait]
pub trait IssuerVerifier: Send + Sync {
    /// The issuer this verifier trusts.
    fn issuer(&self) -> &str;

    /// Verifies signature, issuer, audience, and expiry of `token`.
    async fn verify(&self, token: &str) -> Result<VerifiedClaims, Report<VerifyError>>;
}

#[derive(Clone)]
struct VerificationKey {
    kid: Option<String>,
    key: DecodingKey,
}

/// JWT verifier for one issuer with a fixed key set.
#[derive(Clone)]
pub struct JwtVerifier {
    issuer: String,
    audiences: Vec<String>,
    algorithms: Vec<Algorithm>,
    keys: Vec<VerificationKey>,
    leeway_seconds: u64,
    groups_claim: String,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.issuer)
            .field("audiences", &self.audiences)
            .field("algorithms", &self.algorithms)
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// Creates a verifier for `issuer` that accepts the asymmetric algorithms
    /// identity providers sign with. Add keys before use.
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audiences: Vec::new(),
            algorithms: vec![
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
                Algorithm::ES256,
                Algorithm::ES384,
            ],
            keys: Vec::new(),
            leeway_seconds: 0,
            groups_claim: "groups".to_string(),
        }
    }

    /// Accepted audiences. With none, the audience is not checked.
    #[must_use]
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }

    #[must_use]
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Adds a key. A key without an id is tried for every token.
    #[must_use]
    pub fn with_key(mut self, kid: Option<String>, key: DecodingKey) -> Self {
        self.keys.push(VerificationKey { kid, key });
        self
    }

    /// Adds every usable key of a JWKS document.
    #[must_use]
    pub fn with_jwks(mut self, jwks: &JwkSet) -> Self {
        for jwk in &jwks.keys {
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => self.keys.push(VerificationKey {
                    kid: jwk.common.key_id.clone(),
                    key,
                }),
                Err(e) => {
                    warn!(issuer = %self.issuer, kid = ?jwk.common.key_id, error = %e, "skipping unusable JWKS key");
                }
            }
        }
        self
    }

    #[must_use]
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_groups_claim(mut self, claim: impl Into<String>) -> Self {
        self.groups_claim = claim.into();
        self
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.issuer]);
        if self.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.audiences);
        }
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.leeway = self.leeway_seconds;
        validation
    }
}

fn classify(err: &JwtError) -> VerifyError {
    match err.kind() {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            VerifyError::Malformed {
                reason: err.to_string(),
            }
        }
        _ => VerifyError::Rejected {
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl IssuerVerifier for JwtVerifier {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn verify(&self, token: &str) -> Result<VerifiedClaims, Report<VerifyError>> {
        let header = decode_header(token).map_err(|e| classify(&e))?;

        if !self.algorithms.contains(&header.alg) {
            return Err(VerifyError::Rejected {
                reason: format!("algorithm {:?} is not accepted", header.alg),
            }
            .into());
        }

        let candidates: Vec<&VerificationKey> = self
            .keys
            .iter()
            .filter(|k| k.kid.is_none() || header.kid.is_none() || k.kid == header.kid)
            .collect();
        if candidates.is_empty() {
            return Err(VerifyError::UnknownKey { kid: header.kid }.into());
        }

        let validation = self.validation(header.alg);
        let mut last_error = None;
        for candidate in candidates {
            match decode::<Value>(token, &candidate.key, &validation) {
                Ok(data) => {
                    let claims = VerifiedClaims::from_value(data.claims, &self.groups_claim)?;
                    debug!(issuer = %self.issuer, subject = %claims.subject, "verified bearer token");
                    return Ok(claims);
                }
                Err(e) => last_error = Some(classify(&e)),
            }
        }

        Err(last_error
            .unwrap_or(VerifyError::UnknownKey { kid: header.kid })
            .into())
    }
}
