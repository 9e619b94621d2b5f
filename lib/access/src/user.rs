//! Identity and user domain types.
//!
//! An [`Identity`] is what the OAuth provider tells us about a person at
//! login time. A [`User`] is our record of them: the identity plus the role
//! and activation state we manage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permission::Role;

/// Profile returned by an OAuth provider for a completed login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Provider name (e.g. "github").
    pub provider: String,
    /// Stable provider-issued user id.
    pub provider_id: String,
    /// Login name at the provider.
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Identity {
    /// Creates an identity with only the required fields.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        provider_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            provider_id: provider_id.into(),
            username: username.into(),
            email: None,
            display_name: None,
            avatar_url: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// A known user of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    identity: Identity,
    role: Role,
    #[serde(default = "default_active")]
    active: bool,
    created_at: DateTime<Utc>,
    last_login: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl User {
    /// Creates a new, active user that has never logged in.
    #[must_use]
    pub fn new(identity: Identity, role: Role, created_at: DateTime<Utc>) -> Self {
        Self {
            identity,
            role,
            active: true,
            created_at,
            last_login: None,
        }
    }

    /// The synthetic administrator used when authentication is disabled.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Identity::new("system", "system", "system"), Role::Admin, Utc::now())
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.identity.username
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.identity.email.as_deref()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_login(&self) -> Option<DateTime<Utc>> {
        self.last_login
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Replaces the profile fields with a fresh identity from the provider.
    pub fn refresh_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }

    /// Stamps a successful login.
    pub fn record_login(&mut self, at: DateTime<Utc>) {
        self.last_login = Some(at);
    }
}
