//! Client-side session storage.
//!
//! The encoded session travels in the cookies themselves. Browsers cap the
//! size of a single cookie, so a large session is split into numbered chunks:
//! `<name>`, `<name>_1`, `<name>_2`, and so on.

use crate::codec::SessionCodec;
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::state::SessionState;
use crate::store::{LocalLock, RefreshLock, SessionStore};
use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rootcause::prelude::Report;
use serde::Deserialize;
use std::sync::Arc;
use time::Duration as TimeDuration;
use tracing::{debug, warn};

/// `SameSite` policy for session cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    #[default]
    Lax,
    Strict,
    None,
}

impl From<SameSitePolicy> for SameSite {
    fn from(policy: SameSitePolicy) -> Self {
        match policy {
            SameSitePolicy::Lax => SameSite::Lax,
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::None => SameSite::None,
        }
    }
}

/// Attributes shared by every session cookie.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieOptions {
    /// Cookie name, and the prefix of chunk cookie names.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default = "default_path")]
    pub path: String,

    /// Whether to set the Secure flag on cookies (requires HTTPS).
    /// Defaults to true for production safety; set to false for local HTTP development.
    #[serde(default = "default_true")]
    pub secure: bool,

    #[serde(default = "default_true")]
    pub http_only: bool,

    #[serde(default)]
    pub same_site: SameSitePolicy,

    /// Cookie lifetime, and the lifetime of server-side session records.
    #[serde(default = "default_expire_seconds")]
    pub expire_seconds: u64,

    /// Largest value placed in one cookie before the session is chunked.
    #[serde(default = "default_max_value_len")]
    pub max_value_len: usize,
}

fn default_name() -> String {
    "_gatehouse".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_expire_seconds() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_value_len() -> usize {
    3840
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            domain: None,
            path: default_path(),
            secure: default_true(),
            http_only: default_true(),
            same_site: SameSitePolicy::default(),
            expire_seconds: default_expire_seconds(),
            max_value_len: default_max_value_len(),
        }
    }
}

impl CookieOptions {
    /// Returns the session lifetime.
    #[must_use]
    pub fn expire(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.expire_seconds)
    }

    /// Builds a cookie carrying `value` with the configured attributes.
    #[must_use]
    pub fn build(&self, name: impl Into<String>, value: impl Into<String>) -> Cookie<'static> {
        let mut builder = Cookie::build((name.into(), value.into()))
            .path(self.path.clone())
            .http_only(self.http_only)
            .secure(self.secure)
            .same_site(self.same_site.into())
            .max_age(TimeDuration::seconds(
                i64::try_from(self.expire_seconds).unwrap_or(i64::MAX),
            ));
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Builds the template used to delete the cookie `name`.
    #[must_use]
    pub fn removal(&self, name: impl Into<String>) -> Cookie<'static> {
        let mut builder = Cookie::build((name.into(), "")).path(self.path.clone());
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Returns the name of chunk `index`; chunk 0 uses the bare name.
    #[must_use]
    pub fn chunk_name(&self, index: usize) -> String {
        if index == 0 {
            self.name.clone()
        } else {
            format!("{}_{index}", self.name)
        }
    }

    /// Parses a cookie name into its chunk index, if it is one of ours.
    #[must_use]
    pub fn chunk_index(&self, cookie_name: &str) -> Option<usize> {
        if cookie_name == self.name {
            return Some(0);
        }
        let suffix = cookie_name.strip_prefix(&self.name)?.strip_prefix('_')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok().filter(|index| *index > 0)
    }

    fn validate(&self) -> Result<(), Report<StoreError>> {
        if self.name.is_empty() {
            return Err(StoreError::Configuration {
                details: "cookie name must not be empty".to_string(),
            }
            .into());
        }
        if self.max_value_len == 0 {
            return Err(StoreError::Configuration {
                details: "cookie max_value_len must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Session store that keeps the whole encoded session in cookies.
#[derive(Debug, Clone)]
pub struct CookieStore {
    codec: SessionCodec,
    options: CookieOptions,
}

impl CookieStore {
    /// Creates a cookie store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Configuration` for an empty cookie name or a zero
    /// chunk size.
    pub fn new(codec: SessionCodec, options: CookieOptions) -> Result<Self, Report<StoreError>> {
        options.validate()?;
        Ok(Self { codec, options })
    }

    /// Chunk indices with a visible value in `ctx`, ascending.
    fn visible_chunks(&self, ctx: &RequestContext) -> Vec<usize> {
        let mut indices: Vec<usize> = ctx
            .visible_names()
            .iter()
            .filter_map(|name| self.options.chunk_index(name))
            .collect();
        indices.sort_unstable();
        indices
    }

    fn read_chunks(&self, ctx: &RequestContext) -> Result<Option<String>, StoreError> {
        let present = self.visible_chunks(ctx);
        if present.is_empty() {
            return Ok(None);
        }

        let mut joined = String::new();
        let mut next = 0;
        loop {
            let values = ctx.cookie_values(&self.options.chunk_name(next));
            match values.as_slice() {
                [] => break,
                [value] => joined.push_str(value),
                _ => {
                    return Err(StoreError::Corrupt {
                        reason: format!("session chunk {next} was sent more than once"),
                    });
                }
            }
            next += 1;
        }

        if next == 0 {
            return Err(StoreError::Corrupt {
                reason: "session chunks present without the first chunk".to_string(),
            });
        }
        if let Some(stray) = present.iter().find(|index| **index >= next) {
            return Err(StoreError::Corrupt {
                reason: format!("session chunk {stray} present after missing chunk {next}"),
            });
        }
        Ok(Some(joined))
    }
}

#[async_trait]
impl SessionStore for CookieStore {
    fn name(&self) -> &'static str {
        "cookie"
    }

    async fn save(
        &self,
        ctx: &mut RequestContext,
        session: &SessionState,
    ) -> Result<(), Report<StoreError>> {
        let record = self
            .codec
            .encode(session)
            .map_err(|report| report.context(StoreError::Codec))?;
        let value = URL_SAFE_NO_PAD.encode(record);

        // base64 output is ASCII, so byte chunks are valid strings.
        let chunks: Vec<&str> = value
            .as_bytes()
            .chunks(self.options.max_value_len)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .collect();

        let stale: Vec<usize> = self
            .visible_chunks(ctx)
            .into_iter()
            .filter(|index| *index >= chunks.len())
            .collect();

        for (index, chunk) in chunks.iter().enumerate() {
            ctx.set_cookie(self.options.build(self.options.chunk_name(index), *chunk));
        }
        for index in &stale {
            ctx.remove_cookie(self.options.removal(self.options.chunk_name(*index)));
        }

        debug!(
            chunks = chunks.len(),
            stale_chunks = stale.len(),
            "saved session to cookies"
        );
        Ok(())
    }

    async fn load(&self, ctx: &RequestContext) -> Result<Option<SessionState>, Report<StoreError>> {
        let Some(value) = self.read_chunks(ctx)? else {
            return Ok(None);
        };

        let record = URL_SAFE_NO_PAD
            .decode(value.as_bytes())
            .map_err(|_| StoreError::Corrupt {
                reason: "session cookie is not valid base64".to_string(),
            })?;

        match self.codec.decode(&record) {
            Ok(session) => Ok(Some(session)),
            Err(report) => {
                warn!(error = %report.current_context(), "discarding undecodable session cookie");
                Err(report.context(StoreError::Corrupt {
                    reason: "session cookie could not be decoded".to_string(),
                }))
            }
        }
    }

    async fn clear(&self, ctx: &mut RequestContext) -> Result<(), Report<StoreError>> {
        let mut indices = self.visible_chunks(ctx);
        if !indices.contains(&0) {
            indices.insert(0, 0);
        }
        for index in indices {
            ctx.remove_cookie(self.options.removal(self.options.chunk_name(index)));
        }
        Ok(())
    }

    fn refresh_lock(&self, _ctx: &RequestContext) -> Arc<dyn RefreshLock> {
        Arc::new(LocalLock)
    }
}
