//! Session state and persistence for the gatehouse gateway.
//!
//! A [`SessionState`] is sealed by the [`SessionCodec`] and kept either in the
//! client's cookies ([`CookieStore`]) or in a key-value backend behind a
//! ticket cookie ([`PersistentStore`]). Both implement [`SessionStore`], and
//! [`RefreshCoordinator`] serializes token refreshes through the store's
//! refresh lock.

pub mod codec;
pub mod context;
pub mod cookie;
pub mod error;
pub mod lock;
pub mod persistent;
pub mod state;
pub mod store;

pub use codec::SessionCodec;
pub use context::RequestContext;
pub use cookie::{CookieOptions, CookieStore, SameSitePolicy};
pub use error::{CodecError, RefreshError, StoreError};
pub use lock::{RefreshConfig, RefreshCoordinator, RefreshOutcome};
pub use persistent::PersistentStore;
pub use persistent::backend::{KeyValueBackend, MemoryBackend};
pub use persistent::redis::{RedisBackend, RedisConfig, RedisTopology};
pub use state::SessionState;
pub use store::{LocalLock, RefreshLock, SessionStore};
