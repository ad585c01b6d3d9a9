//! gatehouse authenticating reverse proxy.
//!
//! Requests pass through the authentication [`pipeline`]; authenticated ones
//! are forwarded to the [`upstream`] service with identity headers attached.

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod upstream;

#[cfg(test)]
mod testing;
