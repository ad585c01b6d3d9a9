//! The session persistence contract.
//!
//! The pipeline talks to every backend through [`SessionStore`]; the backend
//! is chosen once at start-up and the pipeline never inspects which one it
//! has.

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::state::SessionState;
use async_trait::async_trait;
use rootcause::prelude::Report;
use std::sync::Arc;
use std::time::Duration;

/// Persistence for the session bound to a request.
///
/// `save` and `clear` are idempotent and never leave a half-written session
/// visible to a later `load`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Persists `session` for the client behind `ctx`, replacing any
    /// previous session.
    async fn save(
        &self,
        ctx: &mut RequestContext,
        session: &SessionState,
    ) -> Result<(), Report<StoreError>>;

    /// Loads the client's session.
    ///
    /// Returns `Ok(None)` when the client has no session. A damaged session
    /// is reported as `StoreError::Corrupt`, which callers treat as absence.
    async fn load(&self, ctx: &RequestContext) -> Result<Option<SessionState>, Report<StoreError>>;

    /// Removes the client's session.
    async fn clear(&self, ctx: &mut RequestContext) -> Result<(), Report<StoreError>>;

    /// Returns the refresh lock guarding the session behind `ctx`.
    fn refresh_lock(&self, ctx: &RequestContext) -> Arc<dyn RefreshLock>;

    /// Checks that the backend is reachable.
    async fn verify_connection(&self) -> Result<(), Report<StoreError>> {
        Ok(())
    }
}

/// Mutual exclusion for refreshing one session.
#[async_trait]
pub trait RefreshLock: Send + Sync {
    /// Tries to take the lock for `ttl`. Returns false if another holder has
    /// it.
    async fn obtain(&self, ttl: Duration) -> Result<bool, Report<StoreError>>;

    /// Returns true if any holder currently has the lock.
    async fn is_held(&self) -> Result<bool, Report<StoreError>>;

    /// Releases the lock if this instance holds it. Never releases a lock
    /// taken by someone else.
    async fn release(&self) -> Result<(), Report<StoreError>>;
}

/// Lock for sessions no other process can refresh: the session lives only in
/// this client's cookies, so the lock is always granted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLock;

#[async_trait]
impl RefreshLock for LocalLock {
    async fn obtain(&self, _ttl: Duration) -> Result<bool, Report<StoreError>> {
        Ok(true)
    }

    async fn is_held(&self) -> Result<bool, Report<StoreError>> {
        Ok(false)
    }

    async fn release(&self) -> Result<(), Report<StoreError>> {
        Ok(())
    }
}
