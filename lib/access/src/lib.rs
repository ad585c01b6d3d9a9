//! Identity for the gatehouse gateway.
//!
//! Sessions come from two places: the interactive login a [`Provider`] runs,
//! and bearer tokens in the `Authorization` header, which the
//! [`BearerTokenAuthenticator`] checks against each trusted issuer in turn.

pub mod bearer;
pub mod error;
pub mod oidc;
pub mod provider;
pub mod verifier;

pub use bearer::{
    BASIC_TOKEN_PASSWORD, BearerTokenAuthenticator, TokenToSession, TokenToSessionLoader,
    claims_to_session, domain_checked_claims_to_session, find_bearer_token,
};
pub use error::{BearerError, ProviderError, VerifyError};
pub use oidc::{ProviderConfig, ProviderConfigBuilder};
pub use provider::{LoginRequest, LoginState, Provider};
pub use verifier::{IssuerVerifier, JwtVerifier, VerifiedClaims};
