//! Sign-in against the OIDC identity provider.
//!
//! - `oidc`: the [`gatehouse_access::Provider`] backed by OIDC discovery
//! - `routes`: the sign-in, callback, and sign-out endpoints

pub mod oidc;
pub mod routes;

pub use oidc::{OidcProvider, discover_verifier};
pub use routes::{
    AuthError, CALLBACK_PATH, SIGN_IN_PATH, SIGN_OUT_PATH, callback, safe_redirect, sign_in,
    sign_out,
};
