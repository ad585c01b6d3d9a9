//! OIDC provider configuration.
//!
//! Connection settings for the upstream identity provider that signs users
//! in and refreshes their sessions.

use serde::{Deserialize, Serialize};

/// Configuration for the OIDC identity provider.
///
/// Fields with defaults can be omitted when loading from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// The OIDC issuer URL (e.g., "https://auth.example.com/realms/main").
    /// Used for OIDC discovery.
    issuer_url: String,
    /// The OAuth2 client ID registered with the provider.
    client_id: String,
    /// The OAuth2 client secret.
    client_secret: String,
    /// The redirect URI for the OAuth2 callback (e.g., "https://app.example.com/oauth2/callback").
    redirect_uri: String,
    /// OAuth2 scopes to request as a comma-separated string.
    /// Default: "openid,email,profile"
    #[serde(default = "default_scopes")]
    scopes: String,
    /// The claim name in the ID token that contains user groups.
    /// Default: "groups"
    #[serde(default = "default_groups_claim")]
    groups_claim: String,
    /// Comma-separated groups allowed to sign in. Empty allows everyone.
    #[serde(default)]
    allowed_groups: String,
    /// Comma-separated email domains allowed to sign in. `*` allows any
    /// email; an empty list allows none.
    /// Default: "*"
    #[serde(default = "default_email_domains")]
    email_domains: String,
    /// Timeout for calls to the provider, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_scopes() -> String {
    "openid,email,profile".to_string()
}

fn default_groups_claim() -> String {
    "groups".to_string()
}

fn default_email_domains() -> String {
    "*".to_string()
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

impl ProviderConfig {
    /// Creates a new provider configuration with defaults for optional fields.
    #[must_use]
    pub fn new(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            issuer_url,
            client_id,
            client_secret,
            redirect_uri,
            scopes: default_scopes(),
            groups_claim: default_groups_claim(),
            allowed_groups: String::new(),
            email_domains: default_email_domains(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Creates a configuration builder for more customization.
    #[must_use]
    pub fn builder(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> ProviderConfigBuilder {
        ProviderConfigBuilder::new(issuer_url, client_id, client_secret, redirect_uri)
    }

    #[must_use]
    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Returns the OAuth2 scopes to request, parsed from comma-separated string.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        split_list(&self.scopes)
    }

    /// Returns the name of the claim containing user groups.
    #[must_use]
    pub fn groups_claim(&self) -> &str {
        &self.groups_claim
    }

    #[must_use]
    pub fn allowed_groups(&self) -> Vec<&str> {
        split_list(&self.allowed_groups)
    }

    /// Returns true if a user with `groups` may sign in.
    #[must_use]
    pub fn permits(&self, groups: &[String]) -> bool {
        let allowed = self.allowed_groups();
        allowed.is_empty() || groups.iter().any(|g| allowed.contains(&g.as_str()))
    }

    #[must_use]
    pub fn email_domains(&self) -> Vec<&str> {
        split_list(&self.email_domains)
    }

    /// Returns true if a user with `email` may sign in.
    ///
    /// Domains compare case-insensitively and must match the whole part
    /// after the last `@`. Only `*` admits a session without an email.
    #[must_use]
    pub fn permits_email(&self, email: Option<&str>) -> bool {
        let domains = self.email_domains();
        if domains.contains(&"*") {
            return true;
        }
        let Some((_, domain)) = email.and_then(|e| e.rsplit_once('@')) else {
            return false;
        };
        !domain.is_empty() && domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Builder for `ProviderConfig`.
#[derive(Debug)]
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
    scopes: Vec<String>,
}

impl ProviderConfigBuilder {
    /// Creates a new builder with required fields.
    #[must_use]
    pub fn new(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        let config = ProviderConfig::new(issuer_url, client_id, client_secret, redirect_uri);
        let scopes = config.scopes().into_iter().map(str::to_string).collect();
        Self { config, scopes }
    }

    /// Adds a scope to the list of scopes to request.
    #[must_use]
    pub fn add_scope(mut self, scope: String) -> Self {
        if !self.scopes.contains(&scope) {
            self.scopes.push(scope);
        }
        self
    }

    /// Sets the claim name for user groups.
    #[must_use]
    pub fn groups_claim(mut self, claim: String) -> Self {
        self.config.groups_claim = claim;
        self
    }

    /// Restricts sign-in to members of `groups`.
    #[must_use]
    pub fn allowed_groups(mut self, groups: &[&str]) -> Self {
        self.config.allowed_groups = groups.join(",");
        self
    }

    /// Restricts sign-in to emails in `domains`.
    #[must_use]
    pub fn email_domains(mut self, domains: &[&str]) -> Self {
        self.config.email_domains = domains.join(",");
        self
    }

    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    /// Builds the `ProviderConfig`.
    #[must_use]
    pub fn build(mut self) -> ProviderConfig {
        self.config.scopes = self.scopes.join(",");
        self.config
    }
}
