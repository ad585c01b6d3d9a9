//! Random opaque tokens.
//!
//! Session handles and lock tokens are drawn from the operating system's
//! random source. They never encode anything about the user they belong to.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;

/// Number of random bytes behind every token.
const TOKEN_BYTES: usize = 32;

/// Error returned when parsing a token from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTokenError {
    /// The type of token that failed to parse.
    pub token_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseTokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.token_type, self.reason)
    }
}

impl std::error::Error for ParseTokenError {}

fn random_bytes() -> [u8; TOKEN_BYTES] {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Opaque key naming one server-side session record.
///
/// Rendered as 64 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Generates a fresh random handle.
    #[must_use]
    pub fn generate() -> Self {
        let hex = random_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Self(hex)
    }

    /// Returns the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Handles travel in cookies; keep them out of debug logs.
impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionHandle({}…)", &self.0[..8.min(self.0.len())])
    }
}

impl FromStr for SessionHandle {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == TOKEN_BYTES * 2
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(ParseTokenError {
                token_type: "SessionHandle",
                reason: format!("expected {} lowercase hex characters", TOKEN_BYTES * 2),
            });
        }
        Ok(Self(s.to_string()))
    }
}

/// Random value identifying the holder of a refresh lock.
#[derive(Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// Generates a fresh random lock token.
    #[must_use]
    pub fn generate() -> Self {
        Self(URL_SAFE_NO_PAD.encode(random_bytes()))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the token as bytes, the form stored in the lock record.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockToken(..)")
    }
}

/// Per-session encryption key carried in the client's ticket cookie.
///
/// The server stores only ciphertext; without the client's secret a stored
/// record cannot be read.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret([u8; TOKEN_BYTES]);

impl SessionSecret {
    /// Generates a fresh random secret.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn key(&self) -> [u8; TOKEN_BYTES] {
        self.0
    }
}

impl fmt::Display for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

impl FromStr for SessionSecret {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ParseTokenError {
            token_type: "SessionSecret",
            reason: reason.to_string(),
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| invalid("not unpadded base64url"))?;
        let key: [u8; TOKEN_BYTES] = bytes
            .try_into()
            .map_err(|_| invalid("expected 32 bytes"))?;
        Ok(Self(key))
    }
}
