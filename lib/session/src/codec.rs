//! Authenticated encryption of session records.
//!
//! Record layout:
//!
//! ```text
//! version(1) | encoding(1) | key_id(4) | nonce(12) | ciphertext || tag(16)
//! ```
//!
//! The six header bytes are bound to the ciphertext as associated data, and
//! `key_id` is derived from the key so that records written under a different
//! key are reported as foreign rather than tampered.

use crate::error::CodecError;
use crate::state::SessionState;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use rootcause::prelude::Report;
use sha2::{Digest, Sha256};
use std::fmt;

/// Current record format version.
pub const FORMAT_VERSION: u8 = 1;

/// Payload encoding marker for JSON.
const ENCODING_JSON: u8 = 1;

const KEY_LEN: usize = 32;
const KEY_ID_LEN: usize = 4;
const HEADER_LEN: usize = 2 + KEY_ID_LEN;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes a record adds on top of its JSON payload.
pub const RECORD_OVERHEAD: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// Encrypts and authenticates sessions under one key.
#[derive(Clone)]
pub struct SessionCodec {
    cipher: Aes256Gcm,
    key_id: [u8; KEY_ID_LEN],
}

impl SessionCodec {
    /// Creates a codec from raw key bytes.
    #[must_use]
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        let digest = Sha256::digest(key);
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&digest[..KEY_ID_LEN]);
        Self {
            cipher: Aes256Gcm::new((&key).into()),
            key_id,
        }
    }

    /// Creates a codec from a configured secret.
    ///
    /// The secret may be 32 raw bytes or 32 bytes encoded as standard or
    /// url-safe base64, with or without padding.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidKey` if no interpretation yields 32 bytes.
    pub fn from_secret(secret: &str) -> Result<Self, Report<CodecError>> {
        let value = secret.trim();
        let candidates = [
            Some(value.as_bytes().to_vec()),
            STANDARD.decode(value).ok(),
            URL_SAFE.decode(value).ok(),
            STANDARD_NO_PAD.decode(value).ok(),
            URL_SAFE_NO_PAD.decode(value).ok(),
        ];

        for candidate in candidates.into_iter().flatten() {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(candidate.as_slice()) {
                return Ok(Self::new(key));
            }
        }

        Err(CodecError::InvalidKey {
            reason: "secret must be 32 bytes, raw or base64 encoded".to_string(),
        }
        .into())
    }

    /// Encrypts a session into a self-describing record.
    ///
    /// A fresh nonce is drawn for every call, so two encodings of the same
    /// session differ.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidSession` for a session without tokens, or
    /// `CodecError::Serialize` if it cannot be serialized.
    pub fn encode(&self, session: &SessionState) -> Result<Vec<u8>, Report<CodecError>> {
        if !session.has_token() {
            return Err(CodecError::InvalidSession {
                reason: "session has neither an access token nor an ID token".to_string(),
            }
            .into());
        }
        self.seal(&serialize(session)?)
    }

    /// Authenticates, decrypts, and validates a record.
    ///
    /// # Errors
    ///
    /// - `CodecError::Format` when the header names another version, encoding,
    ///   or key, or the record is too short to hold a header.
    /// - `CodecError::Integrity` when authentication fails.
    /// - `CodecError::InvalidSession` when the payload is not a usable session.
    pub fn decode(&self, record: &[u8]) -> Result<SessionState, Report<CodecError>> {
        if record.len() < RECORD_OVERHEAD {
            return Err(CodecError::Format {
                reason: format!("record is {} bytes, shorter than any session", record.len()),
            }
            .into());
        }

        let (header, rest) = record.split_at(HEADER_LEN);
        if header[0] != FORMAT_VERSION {
            return Err(CodecError::Format {
                reason: format!("unsupported format version {}", header[0]),
            }
            .into());
        }
        if header[1] != ENCODING_JSON {
            return Err(CodecError::Format {
                reason: format!("unsupported payload encoding {}", header[1]),
            }
            .into());
        }
        if header[2..] != self.key_id {
            return Err(CodecError::Format {
                reason: "record was written with a different key".to_string(),
            }
            .into());
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| CodecError::Integrity)?;

        let session: SessionState =
            serde_json::from_slice(&plaintext).map_err(|e| CodecError::InvalidSession {
                reason: format!("payload is not a session: {e}"),
            })?;

        if !session.has_token() {
            return Err(CodecError::InvalidSession {
                reason: "session has neither an access token nor an ID token".to_string(),
            }
            .into());
        }
        Ok(session)
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = FORMAT_VERSION;
        header[1] = ENCODING_JSON;
        header[2..].copy_from_slice(&self.key_id);
        header
    }

    fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, Report<CodecError>> {
        let header = self.header();
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: payload,
                    aad: &header,
                },
            )
            .map_err(|_| CodecError::Serialize {
                reason: "encryption failed".to_string(),
            })?;

        let mut record = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

fn serialize(session: &SessionState) -> Result<Vec<u8>, Report<CodecError>> {
    serde_json::to_vec(session).map_err(|e| {
        CodecError::Serialize {
            reason: e.to_string(),
        }
        .into()
    })
}
