//! Lock-guarded session refresh.
//!
//! When several requests carrying the same session find it stale at once,
//! exactly one of them asks the provider for new tokens. The rest wait for
//! the lock holder to finish and reload the session it saved.

use crate::context::RequestContext;
use crate::error::RefreshError;
use crate::state::SessionState;
use crate::store::{RefreshLock, SessionStore};
use chrono::Utc;
use rootcause::prelude::Report;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timing of the refresh protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Sessions expiring within this window are refreshed early.
    #[serde(default = "default_skew_seconds")]
    pub skew_seconds: u64,

    /// Lifetime of a refresh lock; an abandoned lock frees itself after this.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// How long a request waits on another holder before giving up.
    #[serde(default = "default_lock_wait_budget_ms")]
    pub lock_wait_budget_ms: u64,
}

fn default_skew_seconds() -> u64 {
    10
}

fn default_lock_ttl_ms() -> u64 {
    5_000
}

fn default_lock_retry_interval_ms() -> u64 {
    100
}

fn default_lock_wait_budget_ms() -> u64 {
    3_000
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            skew_seconds: default_skew_seconds(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            lock_wait_budget_ms: default_lock_wait_budget_ms(),
        }
    }
}

impl RefreshConfig {
    #[must_use]
    pub fn skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.skew_seconds).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms.max(1))
    }

    #[must_use]
    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.lock_wait_budget_ms)
    }
}

/// How a refresh attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This request refreshed the session and saved it.
    Refreshed(SessionState),
    /// Another request refreshed the session; this one reloaded the result.
    Reloaded(SessionState),
    /// The stored session was removed, e.g. after another request's refresh
    /// failed. The client has no session left.
    Gone,
    /// No refreshed session is available to this request: the lock stayed
    /// busy past the wait budget, or its holder finished without saving a
    /// fresh session. The stored session is left as is.
    Unavailable,
}

impl RefreshOutcome {
    /// Returns the usable session, if any.
    #[must_use]
    pub fn into_session(self) -> Option<SessionState> {
        match self {
            Self::Refreshed(session) | Self::Reloaded(session) => Some(session),
            Self::Gone | Self::Unavailable => None,
        }
    }
}

/// Releases a held lock when dropped, including when the refresh future is
/// cancelled mid-flight.
struct LockGuard {
    lock: Option<Arc<dyn RefreshLock>>,
}

impl LockGuard {
    fn new(lock: Arc<dyn RefreshLock>) -> Self {
        Self { lock: Some(lock) }
    }

    async fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(report) = lock.release().await {
                warn!(error = %report.current_context(), "failed to release refresh lock");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(report) = lock.release().await {
                    warn!(error = %report.current_context(), "failed to release abandoned refresh lock");
                }
            });
        }
    }
}

/// Runs the refresh protocol against a session store.
#[derive(Debug, Clone, Default)]
pub struct RefreshCoordinator {
    config: RefreshConfig,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(config: RefreshConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Returns true if `session` is inside the refresh window now.
    #[must_use]
    pub fn needs_refresh(&self, session: &SessionState) -> bool {
        session.needs_refresh_at(Utc::now(), self.config.skew())
    }

    /// Refreshes `session`, or waits for a concurrent refresh of it.
    ///
    /// `refresh` is called at most once, only by a request that obtained the
    /// lock on its first attempt, and receives the freshest stored copy of
    /// the session. Its result is merged into that copy and saved through
    /// `store`. A save failure is logged and the refreshed session is still
    /// returned. When `refresh` fails the stored session is cleared before
    /// the lock is released.
    ///
    /// A request that finds the lock held never calls `refresh`. Once the
    /// lock is free it reloads the session and returns `Reloaded` if it is
    /// fresh, `Gone` if it was removed, and `Unavailable` otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error from `refresh` after releasing the lock, or
    /// `RefreshError::Store` if the lock or the store cannot be consulted.
    pub async fn refresh<F, Fut>(
        &self,
        store: &dyn SessionStore,
        ctx: &mut RequestContext,
        session: &SessionState,
        refresh: F,
    ) -> Result<RefreshOutcome, Report<RefreshError>>
    where
        F: FnOnce(SessionState) -> Fut,
        Fut: Future<Output = Result<SessionState, Report<RefreshError>>>,
    {
        let lock = store.refresh_lock(ctx);
        let obtained = lock
            .obtain(self.config.lock_ttl())
            .await
            .map_err(|report| report.context(RefreshError::Store))?;

        if obtained {
            let guard = LockGuard::new(Arc::clone(&lock));
            return self.refresh_holding(guard, store, ctx, session, refresh).await;
        }

        let deadline = Instant::now() + self.config.wait_budget();
        loop {
            if Instant::now() >= deadline {
                warn!(
                    user = session.user(),
                    budget_ms = self.config.lock_wait_budget_ms,
                    "gave up waiting for refresh lock"
                );
                return Ok(RefreshOutcome::Unavailable);
            }

            tokio::time::sleep(self.config.retry_interval()).await;

            let held = lock
                .is_held()
                .await
                .map_err(|report| report.context(RefreshError::Store))?;
            if !held {
                return self.after_wait(store, ctx, session).await;
            }
        }
    }

    async fn refresh_holding<F, Fut>(
        &self,
        guard: LockGuard,
        store: &dyn SessionStore,
        ctx: &mut RequestContext,
        session: &SessionState,
        refresh: F,
    ) -> Result<RefreshOutcome, Report<RefreshError>>
    where
        F: FnOnce(SessionState) -> Fut,
        Fut: Future<Output = Result<SessionState, Report<RefreshError>>>,
    {
        let current = match store.load(ctx).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                guard.release().await;
                debug!(user = session.user(), "session removed before refresh");
                return Ok(RefreshOutcome::Gone);
            }
            Err(report) => {
                warn!(error = %report.current_context(), "failed to reload session before refresh");
                session.clone()
            }
        };
        if !self.needs_refresh(&current) {
            guard.release().await;
            debug!(user = current.user(), "session already refreshed by another request");
            return Ok(RefreshOutcome::Reloaded(current));
        }

        let refreshed = match refresh(current.clone()).await {
            Ok(refreshed) => current.merge_refresh(refreshed),
            Err(report) => {
                // Waiters must find the session gone, not stale.
                if let Err(clear) = store.clear(ctx).await {
                    warn!(
                        store = store.name(),
                        error = %clear.current_context(),
                        "failed to clear session after refresh failure"
                    );
                }
                guard.release().await;
                return Err(report);
            }
        };

        if let Err(report) = store.save(ctx, &refreshed).await {
            warn!(
                store = store.name(),
                error = %report.current_context(),
                "failed to save refreshed session"
            );
        }
        guard.release().await;
        info!(
            user = refreshed.user(),
            age_seconds = refreshed.age_at(Utc::now()).num_seconds(),
            "refreshed session"
        );
        Ok(RefreshOutcome::Refreshed(refreshed))
    }

    /// Decides the outcome for a request that waited on another holder.
    async fn after_wait(
        &self,
        store: &dyn SessionStore,
        ctx: &RequestContext,
        session: &SessionState,
    ) -> Result<RefreshOutcome, Report<RefreshError>> {
        match store.load(ctx).await {
            Ok(Some(current)) if !self.needs_refresh(&current) => {
                debug!(user = current.user(), "reloaded session refreshed by another request");
                Ok(RefreshOutcome::Reloaded(current))
            }
            Ok(Some(_)) => {
                info!(user = session.user(), "refresh lock released without a fresh session");
                Ok(RefreshOutcome::Unavailable)
            }
            Ok(None) => {
                debug!(user = session.user(), "session removed while waiting for refresh");
                Ok(RefreshOutcome::Gone)
            }
            Err(report) => Err(report.context(RefreshError::Store)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::CookieOptions;
    use crate::persistent::PersistentStore;
    use crate::persistent::backend::{KeyValueBackend, MemoryBackend};
    use chrono::Duration as ChronoDuration;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> Arc<PersistentStore> {
        Arc::new(PersistentStore::new(
            Arc::new(MemoryBackend::new()) as Arc<dyn KeyValueBackend>,
            CookieOptions::default(),
            "lock-test-",
            Duration::from_secs(1),
        ))
    }

    fn stale_session() -> SessionState {
        SessionState::new("user-1", Utc::now() - ChronoDuration::hours(1))
            .with_tokens(
                Some("old-access".to_string()),
                None,
                Some("refresh-1".to_string()),
            )
            .with_expires_on(Some(Utc::now() - ChronoDuration::seconds(1)))
    }

    fn refreshed_tokens() -> SessionState {
        SessionState::new("user-1", Utc::now())
            .with_tokens(Some("new-access".to_string()), None, None)
            .with_expires_on(Some(Utc::now() + ChronoDuration::hours(1)))
    }

    async fn provider_ok(_session: SessionState) -> Result<SessionState, Report<RefreshError>> {
        Ok(refreshed_tokens())
    }

    async fn provider_rejects(
        _session: SessionState,
    ) -> Result<SessionState, Report<RefreshError>> {
        Err(RefreshError::ProviderRejected {
            reason: "invalid_grant".to_string(),
        }
        .into())
    }

    async fn saved(store: &PersistentStore, session: &SessionState) -> RequestContext {
        let mut ctx = RequestContext::default();
        store.save(&mut ctx, session).await.expect("save");
        ctx.next_request()
    }

    fn coordinator(wait_budget_ms: u64) -> RefreshCoordinator {
        RefreshCoordinator::new(RefreshConfig {
            skew_seconds: 10,
            lock_ttl_ms: 2_000,
            lock_retry_interval_ms: 10,
            lock_wait_budget_ms: wait_budget_ms,
        })
    }

    #[tokio::test]
    async fn single_request_refreshes_and_saves() {
        let store = store();
        let session = stale_session();
        let mut ctx = saved(&store, &session).await;

        let outcome = coordinator(1_000)
            .refresh(store.as_ref(), &mut ctx, &session, provider_ok)
            .await
            .expect("refresh");

        let RefreshOutcome::Refreshed(refreshed) = outcome else {
            panic!("expected a refresh, got {outcome:?}");
        };
        assert_eq!(refreshed.access_token(), Some("new-access"));
        assert_eq!(refreshed.refresh_token(), Some("refresh-1"));
        assert_eq!(refreshed.created_at(), session.created_at());

        let stored = store.load(&ctx.next_request()).await.expect("load");
        assert_eq!(stored, Some(refreshed));
        assert!(!store.refresh_lock(&ctx).is_held().await.expect("peek"));
    }

    #[tokio::test]
    async fn concurrent_requests_refresh_once() {
        let store = store();
        let session = stale_session();
        let ctx = saved(&store, &session).await;
        let coordinator = coordinator(2_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let attempts = (0..8).map(|_| {
            let store = Arc::clone(&store);
            let mut ctx = ctx.clone();
            let session = session.clone();
            let coordinator = coordinator.clone();
            let calls = Arc::clone(&calls);
            async move {
                coordinator
                    .refresh(store.as_ref(), &mut ctx, &session, |current| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        provider_ok(current).await
                    })
                    .await
                    .expect("refresh")
            }
        });
        let outcomes = join_all(attempts).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let refreshed = outcomes
            .iter()
            .filter(|o| matches!(o, RefreshOutcome::Refreshed(_)))
            .count();
        assert_eq!(refreshed, 1);
        for outcome in outcomes {
            let session = outcome.into_session().expect("every request gets a session");
            assert_eq!(session.access_token(), Some("new-access"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lock_is_recovered_after_ttl() {
        let store = store();
        let session = stale_session();
        let mut ctx = saved(&store, &session).await;

        let crashed = store.refresh_lock(&ctx);
        assert!(crashed.obtain(Duration::from_millis(500)).await.expect("obtain"));

        // The waiter outlives the abandoned lock but leaves the refresh to
        // the next request.
        let outcome = coordinator(2_000)
            .refresh(store.as_ref(), &mut ctx, &session, provider_ok)
            .await
            .expect("wait");
        assert_eq!(outcome, RefreshOutcome::Unavailable);

        let outcome = coordinator(2_000)
            .refresh(store.as_ref(), &mut ctx, &session, provider_ok)
            .await
            .expect("refresh");
        assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_past_budget_is_unavailable() {
        let store = store();
        let session = stale_session();
        let mut ctx = saved(&store, &session).await;

        let holder = store.refresh_lock(&ctx);
        assert!(holder.obtain(Duration::from_secs(60)).await.expect("obtain"));

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let outcome = coordinator(300)
            .refresh(store.as_ref(), &mut ctx, &session, move |current| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                provider_ok(current).await
            })
            .await
            .expect("refresh");
        assert_eq!(outcome, RefreshOutcome::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_failure_releases_lock_and_clears_session() {
        let store = store();
        let session = stale_session();
        let mut ctx = saved(&store, &session).await;

        let err = coordinator(1_000)
            .refresh(store.as_ref(), &mut ctx, &session, provider_rejects)
            .await
            .expect_err("refresh succeeded");
        assert!(matches!(
            err.current_context(),
            RefreshError::ProviderRejected { .. }
        ));
        assert!(!store.refresh_lock(&ctx).is_held().await.expect("peek"));

        let stored = store.load(&ctx.next_request()).await.expect("load");
        assert_eq!(stored, None);
    }

    #[tokio::test]
    async fn waiters_do_not_retry_a_failed_refresh() {
        let store = store();
        let session = stale_session();
        let ctx = saved(&store, &session).await;
        let coordinator = coordinator(2_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let attempts = (0..4).map(|_| {
            let store = Arc::clone(&store);
            let mut ctx = ctx.clone();
            let session = session.clone();
            let coordinator = coordinator.clone();
            let calls = Arc::clone(&calls);
            async move {
                coordinator
                    .refresh(store.as_ref(), &mut ctx, &session, |current| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        provider_rejects(current).await
                    })
                    .await
            }
        });
        let outcomes = join_all(attempts).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        assert_eq!(failed, 1);
        for outcome in outcomes.into_iter().flatten() {
            assert_eq!(outcome, RefreshOutcome::Gone);
        }
    }

    #[tokio::test]
    async fn removed_session_is_not_refreshed() {
        let store = store();
        let session = stale_session();
        let mut ctx = saved(&store, &session).await;
        store.clear(&mut ctx).await.expect("clear");

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let outcome = coordinator(1_000)
            .refresh(store.as_ref(), &mut ctx, &session, move |current| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                provider_ok(current).await
            })
            .await
            .expect("refresh");
        assert_eq!(outcome, RefreshOutcome::Gone);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_refresh_releases_lock() {
        let store = store();
        let session = stale_session();
        let mut ctx = saved(&store, &session).await;
        let coordinator = coordinator(1_000);

        let attempt = coordinator.refresh(store.as_ref(), &mut ctx, &session, |current| async move {
            std::future::pending::<()>().await;
            provider_ok(current).await
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(50), attempt).await;
        assert!(timed_out.is_err());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!store.refresh_lock(&ctx).is_held().await.expect("peek"));
    }

    #[tokio::test]
    async fn fresh_session_in_store_is_reloaded_without_refresh() {
        let store = store();
        let stale = stale_session();
        let fresh = stale.merge_refresh(refreshed_tokens());
        let mut ctx = saved(&store, &fresh).await;

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let outcome = coordinator(1_000)
            .refresh(store.as_ref(), &mut ctx, &stale, move |current| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                provider_ok(current).await
            })
            .await
            .expect("refresh");
        assert_eq!(outcome, RefreshOutcome::Reloaded(fresh));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_defaults() {
        let config = RefreshConfig::default();
        assert_eq!(config.skew(), chrono::Duration::seconds(10));
        assert_eq!(config.lock_ttl(), Duration::from_secs(5));
        assert_eq!(config.retry_interval(), Duration::from_millis(100));
        assert_eq!(config.wait_budget(), Duration::from_secs(3));
    }
}
