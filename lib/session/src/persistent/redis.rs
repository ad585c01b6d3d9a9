//! Redis backend in standalone, sentinel, or cluster topology.

use super::backend::KeyValueBackend;
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{SentinelClient, SentinelServerType};
use redis::{AsyncCommands, Client, Cmd, Pipeline, RedisError, RedisFuture, Value};
use rootcause::prelude::Report;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// How the Redis deployment is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedisTopology {
    #[default]
    Standalone,
    Sentinel,
    Cluster,
}

/// Redis connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub topology: RedisTopology,

    /// URL of a standalone server, e.g. `redis://127.0.0.1:6379/0`.
    #[serde(default)]
    pub connection_url: Option<String>,

    /// Sentinel addresses for the sentinel topology.
    #[serde(default)]
    pub sentinel_urls: Vec<String>,

    /// Name of the master the sentinels monitor.
    #[serde(default)]
    pub sentinel_master_name: Option<String>,

    /// Seed nodes for the cluster topology.
    #[serde(default)]
    pub cluster_urls: Vec<String>,

    /// Prefix applied to every session key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "gatehouse-".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            topology: RedisTopology::default(),
            connection_url: None,
            sentinel_urls: Vec::new(),
            sentinel_master_name: None,
            cluster_urls: Vec::new(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn configuration(details: &str) -> Report<StoreError> {
    StoreError::Configuration {
        details: details.to_string(),
    }
    .into()
}

fn unavailable(err: &RedisError) -> Report<StoreError> {
    StoreError::Unavailable {
        details: err.to_string(),
    }
    .into()
}

impl RedisConfig {
    /// Checks that the settings for the chosen topology are present.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Configuration` naming the missing setting.
    pub fn validate(&self) -> Result<(), Report<StoreError>> {
        match self.topology {
            RedisTopology::Standalone => {
                if self.connection_url.as_deref().is_none_or(str::is_empty) {
                    return Err(configuration("standalone redis requires connection_url"));
                }
            }
            RedisTopology::Sentinel => {
                if self.sentinel_urls.is_empty() {
                    return Err(configuration("sentinel redis requires sentinel_urls"));
                }
                if self.sentinel_master_name.as_deref().is_none_or(str::is_empty) {
                    return Err(configuration("sentinel redis requires sentinel_master_name"));
                }
            }
            RedisTopology::Cluster => {
                if self.cluster_urls.is_empty() {
                    return Err(configuration("cluster redis requires cluster_urls"));
                }
            }
        }
        Ok(())
    }
}

/// A live connection of whichever kind the topology produced.
#[derive(Clone)]
enum Connection {
    Managed(ConnectionManager),
    Multiplexed(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Connection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Managed(conn) => conn.req_packed_command(cmd),
            Self::Multiplexed(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Managed(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Multiplexed(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Managed(conn) => conn.get_db(),
            Self::Multiplexed(conn) => conn.get_db(),
            Self::Cluster(conn) => conn.get_db(),
        }
    }
}

enum Source {
    Standalone(ConnectionManager),
    Sentinel {
        client: Mutex<SentinelClient>,
        cached: Mutex<Option<MultiplexedConnection>>,
    },
    Cluster(ClusterConnection),
}

/// Redis-backed key-value storage.
///
/// Standalone and cluster connections reconnect on their own. The sentinel
/// connection is discarded after an I/O failure and the master is looked up
/// again on the next call; the failed call itself is not retried.
pub struct RedisBackend {
    source: Source,
    compare_and_delete: redis::Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topology = match self.source {
            Source::Standalone(_) => "standalone",
            Source::Sentinel { .. } => "sentinel",
            Source::Cluster(_) => "cluster",
        };
        f.debug_struct("RedisBackend")
            .field("topology", &topology)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to Redis using the configured topology.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Configuration` for incomplete settings and
    /// `StoreError::Unavailable` if the first connection fails.
    pub async fn connect(config: &RedisConfig) -> Result<Self, Report<StoreError>> {
        config.validate()?;

        let source = match config.topology {
            RedisTopology::Standalone => {
                let url = config.connection_url.clone().unwrap_or_default();
                let client = Client::open(url).map_err(|e| StoreError::Configuration {
                    details: format!("invalid redis connection_url: {e}"),
                })?;
                let manager = ConnectionManager::new(client)
                    .await
                    .map_err(|e| unavailable(&e))?;
                Source::Standalone(manager)
            }
            RedisTopology::Sentinel => {
                let master = config.sentinel_master_name.clone().unwrap_or_default();
                let mut client = SentinelClient::build(
                    config.sentinel_urls.clone(),
                    master,
                    None,
                    SentinelServerType::Master,
                )
                .map_err(|e| StoreError::Configuration {
                    details: format!("invalid sentinel settings: {e}"),
                })?;
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| unavailable(&e))?;
                Source::Sentinel {
                    client: Mutex::new(client),
                    cached: Mutex::new(Some(conn)),
                }
            }
            RedisTopology::Cluster => {
                let client = ClusterClient::new(config.cluster_urls.clone()).map_err(|e| {
                    StoreError::Configuration {
                        details: format!("invalid cluster_urls: {e}"),
                    }
                })?;
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| unavailable(&e))?;
                Source::Cluster(conn)
            }
        };

        info!(topology = ?config.topology, "connected to redis");
        Ok(Self {
            source,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    async fn connection(&self) -> Result<Connection, Report<StoreError>> {
        match &self.source {
            Source::Standalone(manager) => Ok(Connection::Managed(manager.clone())),
            Source::Cluster(conn) => Ok(Connection::Cluster(conn.clone())),
            Source::Sentinel { client, cached } => {
                let mut cached = cached.lock().await;
                if let Some(conn) = cached.as_ref() {
                    return Ok(Connection::Multiplexed(conn.clone()));
                }
                debug!("resolving redis master through sentinels");
                let conn = client
                    .lock()
                    .await
                    .get_async_connection()
                    .await
                    .map_err(|e| unavailable(&e))?;
                *cached = Some(conn.clone());
                Ok(Connection::Multiplexed(conn))
            }
        }
    }

    /// Maps a command failure, forgetting a sentinel connection that broke.
    async fn failed(&self, err: &RedisError) -> Report<StoreError> {
        let broken = err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal();
        if let Source::Sentinel { cached, .. } = &self.source {
            if broken {
                warn!(error = %err, "dropping redis sentinel connection");
                cached.lock().await.take();
            }
        }
        unavailable(err)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Report<StoreError>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = match conn.get(key).await {
            Ok(value) => value,
            Err(e) => return Err(self.failed(&e).await),
        };
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), Report<StoreError>> {
        let mut conn = self.connection().await?;
        let result: Result<(), RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.failed(&e).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Report<StoreError>> {
        let mut conn = self.connection().await?;
        let result: Result<i64, RedisError> = conn.del(key).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.failed(&e).await),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, Report<StoreError>> {
        let mut conn = self.connection().await?;
        let result: Result<bool, RedisError> = conn.exists(key).await;
        match result {
            Ok(exists) => Ok(exists),
            Err(e) => Err(self.failed(&e).await),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, Report<StoreError>> {
        let mut conn = self.connection().await?;
        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(reply) => Ok(reply.is_some()),
            Err(e) => Err(self.failed(&e).await),
        }
    }

    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, Report<StoreError>> {
        let mut conn = self.connection().await?;
        let result: Result<i64, RedisError> = self
            .compare_and_delete
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(deleted) => Ok(deleted == 1),
            Err(e) => Err(self.failed(&e).await),
        }
    }

    async fn ping(&self) -> Result<(), Report<StoreError>> {
        let mut conn = self.connection().await?;
        let result: Result<String, RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.failed(&e).await),
        }
    }
}
