//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the gateway,
//! loaded via the `config` crate from an optional file and environment
//! variables prefixed with `GATEHOUSE_`, nested with `__`
//! (e.g. `GATEHOUSE_SESSION__STORE=redis`).

use gatehouse_access::ProviderConfig;
use gatehouse_session::{CookieOptions, RedisConfig, RefreshConfig};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming an optional configuration file.
pub const CONFIG_FILE_VAR: &str = "GATEHOUSE_CONFIG";

/// Gateway configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Base URL authenticated requests are forwarded to.
    pub upstream_url: String,

    /// Key sealing cookie-resident sessions: 32 bytes, raw or base64.
    pub cookie_secret: String,

    #[serde(default)]
    pub cookie: CookieOptions,

    #[serde(default)]
    pub session: SessionConfig,

    /// OIDC identity provider.
    pub oidc: ProviderConfig,

    #[serde(default)]
    pub bearer: BearerConfig,

    #[serde(default)]
    pub headers: HeaderConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:4180".to_string()
}

/// Where sessions are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Sealed into the client's cookies.
    #[default]
    Cookie,
    Redis,
    /// Process-local; sessions do not survive a restart.
    Memory,
}

/// Session persistence and refresh configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub store: StoreKind,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Time budget for each session store call, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            redis: RedisConfig::default(),
            refresh: RefreshConfig::default(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Bearer-token authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BearerConfig {
    /// Accept requests carrying a JWT from a trusted issuer without a
    /// login.
    #[serde(default)]
    pub skip_jwt_bearer_tokens: bool,

    /// Additional issuers as comma-separated `issuer=audience` pairs,
    /// consulted in order after the login provider.
    #[serde(default)]
    pub extra_jwt_issuers: String,
}

impl BearerConfig {
    /// Returns the extra issuers as `(issuer, audience)` pairs.
    ///
    /// Entries without `=` are skipped.
    #[must_use]
    pub fn extra_issuers(&self) -> Vec<(String, String)> {
        self.extra_jwt_issuers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|entry| entry.split_once('='))
            .map(|(issuer, audience)| (issuer.trim().to_string(), audience.trim().to_string()))
            .filter(|(issuer, audience)| !issuer.is_empty() && !audience.is_empty())
            .collect()
    }
}

/// Identity headers sent upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderConfig {
    #[serde(default = "default_true")]
    pub pass_user_headers: bool,

    #[serde(default)]
    pub pass_access_token: bool,
}

fn default_true() -> bool {
    true
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            pass_user_headers: default_true(),
            pass_access_token: false,
        }
    }
}

/// The user agent Google Cloud load balancers probe with.
pub const GOOGLE_HEALTH_CHECK_USER_AGENT: &str = "GoogleHC/1.0";

/// Health check responses, answered before authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Path answering "OK".
    #[serde(default = "default_ping_path")]
    pub ping_path: String,

    /// Requests with this exact `User-Agent` are answered "OK" on any path.
    /// Empty disables the match.
    #[serde(default)]
    pub ping_user_agent: String,

    /// Also answer `/liveness_check`, `/readiness_check`, and the Google
    /// load balancer's user agent.
    #[serde(default)]
    pub gcp_health_checks: bool,
}

fn default_ping_path() -> String {
    "/ping".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_path: default_ping_path(),
            ping_user_agent: String::new(),
            gcp_health_checks: false,
        }
    }
}

impl HealthConfig {
    /// Paths answered without authentication.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        let mut paths = vec![self.ping_path.as_str()];
        if self.gcp_health_checks {
            paths.extend(["/liveness_check", "/readiness_check"]);
        }
        paths
    }

    /// User agents answered on any path.
    #[must_use]
    pub fn user_agents(&self) -> Vec<&str> {
        let mut agents = Vec::new();
        if !self.ping_user_agent.is_empty() {
            agents.push(self.ping_user_agent.as_str());
        }
        if self.gcp_health_checks {
            agents.push(GOOGLE_HEALTH_CHECK_USER_AGENT);
        }
        agents
    }
}

impl ServerConfig {
    /// Loads configuration from the optional file named by
    /// `GATEHOUSE_CONFIG`, overridden by environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_VAR) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("GATEHOUSE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("session.redis.sentinel_urls")
                    .with_list_parse_key("session.redis.cluster_urls")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(json: &str) -> ServerConfig {
        config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()
            .expect("build")
            .try_deserialize()
            .expect("deserialize")
    }

    const MINIMAL: &str = r#"{
        "upstream_url": "http://127.0.0.1:8080",
        "cookie_secret": "0123456789abcdef0123456789abcdef",
        "oidc": {
            "issuer_url": "https://auth.example.com",
            "client_id": "gatehouse",
            "client_secret": "secret",
            "redirect_uri": "https://app.example.com/oauth2/callback"
        }
    }"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = from_json(MINIMAL);
        assert_eq!(config.listen_addr, "127.0.0.1:4180");
        assert_eq!(config.cookie.name, "_gatehouse");
        assert_eq!(config.session.store, StoreKind::Cookie);
        assert_eq!(config.session.store_timeout(), Duration::from_secs(2));
        assert_eq!(config.session.refresh.skew_seconds, 10);
        assert!(!config.bearer.skip_jwt_bearer_tokens);
        assert!(config.headers.pass_user_headers);
        assert!(!config.headers.pass_access_token);
        assert_eq!(config.health.paths(), vec!["/ping"]);
        assert!(config.health.user_agents().is_empty());
    }

    #[test]
    fn gcp_health_checks_add_paths_and_agent() {
        let health = HealthConfig {
            ping_user_agent: "kube-probe/1.30".to_string(),
            gcp_health_checks: true,
            ..HealthConfig::default()
        };
        assert_eq!(
            health.paths(),
            vec!["/ping", "/liveness_check", "/readiness_check"]
        );
        assert_eq!(
            health.user_agents(),
            vec!["kube-probe/1.30", GOOGLE_HEALTH_CHECK_USER_AGENT]
        );
    }

    #[test]
    fn nested_sections_override_defaults() {
        let config = from_json(
            r#"{
                "upstream_url": "http://127.0.0.1:8080",
                "cookie_secret": "0123456789abcdef0123456789abcdef",
                "oidc": {
                    "issuer_url": "https://auth.example.com",
                    "client_id": "gatehouse",
                    "client_secret": "secret",
                    "redirect_uri": "https://app.example.com/oauth2/callback"
                },
                "session": {
                    "store": "redis",
                    "redis": {"topology": "sentinel", "sentinel_urls": ["redis://s1:26379"], "sentinel_master_name": "main"},
                    "refresh": {"lock_ttl_ms": 2500}
                },
                "cookie": {"secure": false, "same_site": "strict"}
            }"#,
        );
        assert_eq!(config.session.store, StoreKind::Redis);
        assert_eq!(config.session.redis.sentinel_urls, vec!["redis://s1:26379"]);
        assert_eq!(config.session.refresh.lock_ttl_ms, 2500);
        assert_eq!(config.session.refresh.lock_wait_budget_ms, 3000);
        assert!(!config.cookie.secure);
    }

    #[test]
    fn extra_issuers_parse_in_order() {
        let bearer = BearerConfig {
            skip_jwt_bearer_tokens: true,
            extra_jwt_issuers: "https://a.example.com=api-a, broken ,https://b.example.com=api-b"
                .to_string(),
        };
        assert_eq!(
            bearer.extra_issuers(),
            vec![
                ("https://a.example.com".to_string(), "api-a".to_string()),
                ("https://b.example.com".to_string(), "api-b".to_string()),
            ]
        );
    }

    #[test]
    fn session_config_has_correct_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.store, StoreKind::Cookie);
        assert_eq!(config.store_timeout_ms, 2000);
        assert_eq!(config.redis.key_prefix, "gatehouse-");
    }
}
