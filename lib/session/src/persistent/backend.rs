//! Key-value backends for server-side session records.

use crate::error::StoreError;
use async_trait::async_trait;
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// The handful of key-value operations the persistent store needs.
///
/// Every write carries a TTL; an expired key reads as absent.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Report<StoreError>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), Report<StoreError>>;

    async fn delete(&self, key: &str) -> Result<(), Report<StoreError>>;

    async fn exists(&self, key: &str) -> Result<bool, Report<StoreError>>;

    /// Writes `value` only if `key` is absent. Returns true if written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, Report<StoreError>>;

    /// Deletes `key` only if it currently holds `value`. Returns true if
    /// deleted.
    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, Report<StoreError>>;

    async fn ping(&self) -> Result<(), Report<StoreError>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process backend for development and tests.
///
/// Records live only as long as the process. Expiry follows tokio's clock,
/// so tests on a paused runtime can advance past a TTL.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        f(&mut entries)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Report<StoreError>> {
        Ok(self.with_entries(|entries| entries.get(key).map(|entry| entry.value.clone())))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), Report<StoreError>> {
        let entry = Entry {
            value: value.to_vec(),
            expires_at: Instant::now() + ttl,
        };
        self.with_entries(|entries| entries.insert(key.to_string(), entry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Report<StoreError>> {
        self.with_entries(|entries| entries.remove(key));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Report<StoreError>> {
        Ok(self.with_entries(|entries| entries.contains_key(key)))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, Report<StoreError>> {
        let expires_at = Instant::now() + ttl;
        Ok(self.with_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at,
                },
            );
            true
        }))
    }

    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, Report<StoreError>> {
        Ok(self.with_entries(|entries| {
            let matches = entries.get(key).is_some_and(|entry| entry.value == value);
            if matches {
                entries.remove(key);
            }
            matches
        }))
    }

    async fn ping(&self) -> Result<(), Report<StoreError>> {
        Ok(())
    }
}
