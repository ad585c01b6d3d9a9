//! Core types shared by the gatehouse crates.
//!
//! Random, identity-free tokens that name persisted sessions and refresh
//! locks. None of them carry user data.

pub mod token;

pub use token::{LockToken, ParseTokenError, SessionHandle, SessionSecret};
