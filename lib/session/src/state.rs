//! The authenticated-session record.
//!
//! A `SessionState` is created by the login flow or from a verified bearer
//! token, and is only modified by a refresh, which produces a whole new value
//! through [`SessionState::merge_refresh`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One authenticated identity bound to one client.
///
/// Field names are abbreviated on the wire so that cookie-resident sessions
/// stay small.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Stable identifier from the identity provider.
    #[serde(rename = "u")]
    user: String,
    /// Best-effort human-readable identifier.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(rename = "pu", default, skip_serializing_if = "Option::is_none")]
    preferred_username: Option<String>,
    #[serde(rename = "at", default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(rename = "it", default, skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
    #[serde(rename = "rt", default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    /// Set once when the session is created.
    #[serde(rename = "ca")]
    created_at: DateTime<Utc>,
    /// `None` means the session does not expire.
    #[serde(rename = "eo", default, skip_serializing_if = "Option::is_none")]
    expires_on: Option<DateTime<Utc>>,
    #[serde(rename = "g", default, skip_serializing_if = "Vec::is_empty")]
    groups: Vec<String>,
}

impl SessionState {
    /// Creates a session for the given user with no tokens attached.
    #[must_use]
    pub fn new(user: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            user: user.into(),
            email: None,
            preferred_username: None,
            access_token: None,
            id_token: None,
            refresh_token: None,
            created_at,
            expires_on: None,
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    #[must_use]
    pub fn with_preferred_username(mut self, preferred_username: Option<String>) -> Self {
        self.preferred_username = preferred_username;
        self
    }

    /// Attaches provider tokens.
    #[must_use]
    pub fn with_tokens(
        mut self,
        access_token: Option<String>,
        id_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Self {
        self.access_token = access_token;
        self.id_token = id_token;
        self.refresh_token = refresh_token;
        self
    }

    #[must_use]
    pub fn with_expires_on(mut self, expires_on: Option<DateTime<Utc>>) -> Self {
        self.expires_on = expires_on;
        self
    }

    #[must_use]
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    /// Returns the stable user identifier.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn preferred_username(&self) -> Option<&str> {
        self.preferred_username.as_deref()
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    #[must_use]
    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.expires_on
    }

    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Returns true if the session carries an access or ID token.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.access_token.is_some() || self.id_token.is_some()
    }

    /// Returns true if the session has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_some_and(|expires_on| expires_on <= now)
    }

    /// Returns true if the session is expired or will expire within `skew`.
    #[must_use]
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_on
            .is_some_and(|expires_on| expires_on <= now + skew)
    }

    /// Returns how long ago the session was created.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Combines this session with the result of a provider refresh.
    ///
    /// The refreshed tokens and expiry replace the current ones as a unit.
    /// `created_at` is carried over, as is the refresh token when the provider
    /// did not rotate it, and any identity field the provider left empty.
    #[must_use]
    pub fn merge_refresh(&self, refreshed: SessionState) -> SessionState {
        let SessionState {
            user,
            email,
            preferred_username,
            access_token,
            id_token,
            refresh_token,
            created_at: _,
            expires_on,
            groups,
        } = refreshed;

        SessionState {
            user: if user.is_empty() {
                self.user.clone()
            } else {
                user
            },
            email: email.or_else(|| self.email.clone()),
            preferred_username: preferred_username.or_else(|| self.preferred_username.clone()),
            access_token,
            id_token: id_token.or_else(|| self.id_token.clone()),
            refresh_token: refresh_token.or_else(|| self.refresh_token.clone()),
            created_at: self.created_at,
            expires_on,
            groups: if groups.is_empty() {
                self.groups.clone()
            } else {
                groups
            },
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session{{user:{}", self.user)?;
        if let Some(email) = &self.email {
            write!(f, " email:{email}")?;
        }
        if let Some(preferred_username) = &self.preferred_username {
            write!(f, " preferred_username:{preferred_username}")?;
        }
        if self.access_token.is_some() {
            write!(f, " token:true")?;
        }
        if self.id_token.is_some() {
            write!(f, " id_token:true")?;
        }
        write!(f, " created:{}", self.created_at)?;
        if let Some(expires_on) = self.expires_on {
            write!(f, " expires:{expires_on}")?;
        }
        if self.refresh_token.is_some() {
            write!(f, " refresh_token:true")?;
        }
        if !self.groups.is_empty() {
            write!(f, " groups:{}", self.groups.join(","))?;
        }
        write!(f, "}}")
    }
}

// Tokens are secrets; debug output goes through the redacted display form.
impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
