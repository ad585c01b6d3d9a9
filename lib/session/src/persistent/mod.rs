//! Server-side session storage.
//!
//! The client holds only a ticket cookie, `<handle>.<secret>`. The handle
//! names the stored record; the secret is the per-session key the record is
//! encrypted with, so the backend never holds readable sessions.

pub mod backend;
pub mod redis;

use crate::codec::SessionCodec;
use crate::context::RequestContext;
use crate::cookie::CookieOptions;
use crate::error::StoreError;
use crate::state::SessionState;
use crate::store::{RefreshLock, SessionStore};
use async_trait::async_trait;
use backend::KeyValueBackend;
use gatehouse_core::{LockToken, SessionHandle, SessionSecret};
use rootcause::prelude::Report;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Leading byte of every stored record.
const RECORD_VERSION: u8 = 1;

/// Runs a backend call under the store's time budget.
async fn bounded<T>(
    budget: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T, Report<StoreError>>>,
) -> Result<T, Report<StoreError>> {
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation }.into()),
    }
}

#[derive(Clone)]
struct Ticket {
    handle: SessionHandle,
    secret: SessionSecret,
}

impl Ticket {
    fn generate() -> Self {
        Self {
            handle: SessionHandle::generate(),
            secret: SessionSecret::generate(),
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt { reason };
        let (handle, secret) = value
            .split_once('.')
            .ok_or_else(|| corrupt("session ticket has no separator".to_string()))?;
        Ok(Self {
            handle: handle.parse().map_err(|e| corrupt(format!("{e}")))?,
            secret: secret.parse().map_err(|e| corrupt(format!("{e}")))?,
        })
    }

    fn encode(&self) -> String {
        format!("{}.{}", self.handle, self.secret)
    }

    fn codec(&self) -> SessionCodec {
        SessionCodec::new(self.secret.key())
    }
}

/// Session store that keeps records in a key-value backend.
#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn KeyValueBackend>,
    cookie: CookieOptions,
    key_prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("backend", &self.backend.name())
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PersistentStore {
    /// Creates a store over `backend`. Every backend call is bounded by
    /// `timeout`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        cookie: CookieOptions,
        key_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            cookie,
            key_prefix: key_prefix.into(),
            timeout,
        }
    }

    fn record_key(&self, handle: &SessionHandle) -> String {
        format!("{}{}", self.key_prefix, handle)
    }

    /// Reads the ticket from the request, if it sent exactly one.
    fn ticket(&self, ctx: &RequestContext) -> Result<Option<Ticket>, StoreError> {
        let values = ctx.cookie_values(&self.cookie.name);
        match values.as_slice() {
            [] => Ok(None),
            [value] => Ticket::parse(value).map(Some),
            _ => Err(StoreError::Corrupt {
                reason: "session ticket was sent more than once".to_string(),
            }),
        }
    }
}

#[async_trait]
impl SessionStore for PersistentStore {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    #[instrument(skip_all, fields(backend = self.backend.name(), user = session.user()), err)]
    async fn save(
        &self,
        ctx: &mut RequestContext,
        session: &SessionState,
    ) -> Result<(), Report<StoreError>> {
        // Keep the existing ticket so concurrent requests and the refresh
        // lock keep pointing at the same record.
        let ticket = match self.ticket(ctx) {
            Ok(Some(ticket)) => ticket,
            Ok(None) | Err(_) => Ticket::generate(),
        };

        let mut record = vec![RECORD_VERSION];
        record.extend(
            ticket
                .codec()
                .encode(session)
                .map_err(|report| report.context(StoreError::Codec))?,
        );

        let key = self.record_key(&ticket.handle);
        bounded(
            self.timeout,
            "save",
            self.backend.set(&key, &record, self.cookie.expire()),
        )
        .await?;

        ctx.set_cookie(self.cookie.build(self.cookie.name.clone(), ticket.encode()));
        debug!(handle = ?ticket.handle, backend = self.backend.name(), "saved session record");
        Ok(())
    }

    #[instrument(skip_all, fields(backend = self.backend.name()), err)]
    async fn load(&self, ctx: &RequestContext) -> Result<Option<SessionState>, Report<StoreError>> {
        let Some(ticket) = self.ticket(ctx)? else {
            return Ok(None);
        };

        let key = self.record_key(&ticket.handle);
        let Some(record) = bounded(self.timeout, "load", self.backend.get(&key)).await? else {
            debug!(handle = ?ticket.handle, "session record expired or missing");
            return Ok(None);
        };

        let Some((&version, body)) = record.split_first() else {
            return Err(StoreError::Corrupt {
                reason: "empty session record".to_string(),
            }
            .into());
        };
        if version != RECORD_VERSION {
            return Err(StoreError::Corrupt {
                reason: format!("unknown session record version {version}"),
            }
            .into());
        }

        match ticket.codec().decode(body) {
            Ok(session) => Ok(Some(session)),
            Err(report) => {
                warn!(handle = ?ticket.handle, error = %report.current_context(), "discarding undecodable session record");
                Err(report.context(StoreError::Corrupt {
                    reason: "session record could not be decoded".to_string(),
                }))
            }
        }
    }

    #[instrument(skip_all, fields(backend = self.backend.name()), err)]
    async fn clear(&self, ctx: &mut RequestContext) -> Result<(), Report<StoreError>> {
        if let Ok(Some(ticket)) = self.ticket(ctx) {
            let key = self.record_key(&ticket.handle);
            bounded(self.timeout, "clear", self.backend.delete(&key)).await?;
        }
        ctx.remove_cookie(self.cookie.removal(self.cookie.name.clone()));
        Ok(())
    }

    fn refresh_lock(&self, ctx: &RequestContext) -> Arc<dyn RefreshLock> {
        let key = match self.ticket(ctx) {
            Ok(Some(ticket)) => format!("{}.lock", self.record_key(&ticket.handle)),
            // Without a ticket there is no shared record to protect.
            Ok(None) | Err(_) => format!("{}{}.lock", self.key_prefix, SessionHandle::generate()),
        };
        Arc::new(PersistentLock {
            backend: Arc::clone(&self.backend),
            key,
            token: LockToken::generate(),
            timeout: self.timeout,
        })
    }

    async fn verify_connection(&self) -> Result<(), Report<StoreError>> {
        bounded(self.timeout, "ping", self.backend.ping()).await
    }
}

/// Refresh lock stored next to the session record.
///
/// The lock record holds a random token so only the instance that took the
/// lock can release it; an abandoned lock expires with its TTL.
pub struct PersistentLock {
    backend: Arc<dyn KeyValueBackend>,
    key: String,
    token: LockToken,
    timeout: Duration,
}

impl std::fmt::Debug for PersistentLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RefreshLock for PersistentLock {
    #[instrument(skip(self), fields(key = %self.key), err)]
    async fn obtain(&self, ttl: Duration) -> Result<bool, Report<StoreError>> {
        bounded(
            self.timeout,
            "lock",
            self.backend
                .set_if_absent(&self.key, self.token.as_bytes(), ttl),
        )
        .await
    }

    #[instrument(skip_all, fields(key = %self.key), err)]
    async fn is_held(&self) -> Result<bool, Report<StoreError>> {
        bounded(self.timeout, "peek lock", self.backend.exists(&self.key)).await
    }

    #[instrument(skip_all, fields(key = %self.key), err)]
    async fn release(&self) -> Result<(), Report<StoreError>> {
        let released = bounded(
            self.timeout,
            "unlock",
            self.backend
                .delete_if_equals(&self.key, self.token.as_bytes()),
        )
        .await?;
        if !released {
            debug!(key = %self.key, "refresh lock already expired or taken over");
        }
        Ok(())
    }
}
