//! Error types for the session crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `CodecError`: Encoding and decoding of session records
//! - `StoreError`: Session persistence failures (wraps codec errors via context)
//! - `RefreshError`: Failures of the lock-guarded refresh protocol

use std::fmt;

/// Errors from the session codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The configured secret is not usable as a codec key.
    InvalidKey { reason: String },
    /// The record was produced with another key or an unsupported format.
    ///
    /// The header is read before anything is decrypted, so a damaged header
    /// is reported here rather than as `Integrity`: a flipped header byte is
    /// indistinguishable from a record written by another key or version.
    Format { reason: String },
    /// The ciphertext failed authentication. Only raised once the header
    /// matches this codec.
    Integrity,
    /// The record decrypted but does not describe a usable session.
    InvalidSession { reason: String },
    /// The session could not be serialized.
    Serialize { reason: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey { reason } => write!(f, "invalid session key: {reason}"),
            Self::Format { reason } => write!(f, "unrecognised session record: {reason}"),
            Self::Integrity => write!(f, "session record failed integrity check"),
            Self::InvalidSession { reason } => write!(f, "invalid session: {reason}"),
            Self::Serialize { reason } => write!(f, "failed to serialize session: {reason}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors from session store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    Unavailable { details: String },
    /// A store operation exceeded its time budget.
    Timeout { operation: &'static str },
    /// The persisted session is damaged and must be treated as absent.
    Corrupt { reason: String },
    /// The session could not be encoded for storage.
    Codec,
    /// The store is misconfigured.
    Configuration { details: String },
}

impl StoreError {
    /// Returns true if the error reflects damaged client data rather than
    /// backend trouble.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "session store unavailable: {details}"),
            Self::Timeout { operation } => write!(f, "session store {operation} timed out"),
            Self::Corrupt { reason } => write!(f, "corrupt session: {reason}"),
            Self::Codec => write!(f, "failed to encode session"),
            Self::Configuration { details } => {
                write!(f, "session store configuration error: {details}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the lock-guarded refresh protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The identity provider refused to refresh the session.
    ProviderRejected { reason: String },
    /// The refresh lock could not be consulted.
    Store,
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderRejected { reason } => write!(f, "session refresh failed: {reason}"),
            Self::Store => write!(f, "refresh lock unavailable"),
        }
    }
}

impl std::error::Error for RefreshError {}
