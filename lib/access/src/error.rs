//! Error types for the access crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `BearerError`: Authorization header parsing and bearer authentication
//! - `VerifyError`: A single issuer's verdict on a token
//! - `ProviderError`: Identity provider calls (login, redemption, refresh)
//!
//! None of these carry a raw token or header value.

use std::fmt;

/// Errors from bearer-token authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerError {
    /// The Authorization header is not `scheme credential`.
    MalformedHeader { reason: &'static str },
    /// The header carried no JWT-shaped credential.
    NoBearerToken,
    /// No configured issuer accepted the token.
    UntrustedToken { issuers_tried: usize },
    /// The token verified but could not be turned into a session.
    Conversion { reason: String },
}

impl BearerError {
    /// Returns true if the request simply carried no usable token.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NoBearerToken)
    }
}

impl fmt::Display for BearerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader { reason } => {
                write!(f, "malformed authorization header: {reason}")
            }
            Self::NoBearerToken => {
                write!(f, "no valid bearer token found in authorization header")
            }
            Self::UntrustedToken { issuers_tried } => {
                write!(f, "bearer token rejected by all {issuers_tried} trusted issuers")
            }
            Self::Conversion { reason } => {
                write!(f, "unable to build session from bearer token: {reason}")
            }
        }
    }
}

impl std::error::Error for BearerError {}

/// Errors from verifying a token against one issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The token is not a decodable JWT.
    Malformed { reason: String },
    /// No configured key matches the token's key id.
    UnknownKey { kid: Option<String> },
    /// Signature, issuer, audience, or expiry check failed.
    Rejected { reason: String },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed token: {reason}"),
            Self::UnknownKey { kid: Some(kid) } => write!(f, "no verification key for kid {kid}"),
            Self::UnknownKey { kid: None } => write!(f, "no verification key for token"),
            Self::Rejected { reason } => write!(f, "token rejected: {reason}"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Errors from identity provider operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider settings are unusable.
    Configuration { details: String },
    /// Provider metadata could not be discovered.
    Discovery { details: String },
    /// An authorization code could not be redeemed.
    Redeem { details: String },
    /// The provider refused to refresh the session.
    Refresh { details: String },
    /// A provider call exceeded its time budget.
    Timeout { operation: &'static str },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { details } => write!(f, "provider configuration error: {details}"),
            Self::Discovery { details } => write!(f, "provider discovery failed: {details}"),
            Self::Redeem { details } => write!(f, "code redemption failed: {details}"),
            Self::Refresh { details } => write!(f, "token refresh failed: {details}"),
            Self::Timeout { operation } => write!(f, "provider {operation} timed out"),
        }
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_error_display() {
        let err = BearerError::UntrustedToken { issuers_tried: 2 };
        assert!(err.to_string().contains("2 trusted issuers"));
        assert!(BearerError::NoBearerToken.is_absent());
        assert!(!err.is_absent());
    }

    #[test]
    fn verify_error_unknown_key_display() {
        let err = VerifyError::UnknownKey {
            kid: Some("key-7".to_string()),
        };
        assert!(err.to_string().contains("key-7"));
        assert!(!VerifyError::UnknownKey { kid: None }.to_string().contains("kid"));
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::Refresh {
            details: "invalid_grant".to_string(),
        };
        assert!(err.to_string().contains("invalid_grant"));
        assert!(
            ProviderError::Timeout { operation: "refresh" }
                .to_string()
                .contains("timed out")
        );
    }
}
