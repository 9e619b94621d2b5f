//! Authentication configuration.
//!
//! Deserialized by the server's `config` loader. Every optional field has a
//! serde default so a minimal environment only needs `enabled`, the provider
//! credentials, and the session secret.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::ConfigurationError;
use crate::permission::Role;
use crate::session::SessionSettings;
use crate::user_store::RoleAssignments;
use rootcause::prelude::*;

/// Minimum accepted length of the session secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Upper bound for any duration setting: ten years, in seconds.
const MAX_DURATION_SECS: u64 = 315_360_000;

/// Which OAuth provider to authenticate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Github,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
        }
    }
}

/// GitHub OAuth application settings.
#[derive(Debug, Deserialize)]
pub struct GitHubSettings {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Must match the callback URL registered with the OAuth app exactly.
    pub redirect_uri: String,
    /// Requested scopes. Default: `["user:email"]`.
    #[serde(default = "default_github_scopes")]
    pub scopes: Vec<String>,
    /// Override for GitHub Enterprise. Default: `https://github.com`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Override for GitHub Enterprise. Default: `https://api.github.com`.
    #[serde(default)]
    pub api_url: Option<String>,
}

fn default_github_scopes() -> Vec<String> {
    vec!["user:email".to_string()]
}

/// Authentication and authorization configuration.
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// When false, every request runs as the built-in admin `system` user.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub provider: ProviderKind,

    /// Role for users with no explicit assignment.
    #[serde(default = "default_role")]
    pub default_role: Role,

    /// Session lifetime in seconds.
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// Extend the session on every validated request.
    #[serde(default = "default_true")]
    pub sliding_refresh: bool,

    /// Lifetime of a pending login (CSRF state) in seconds.
    #[serde(default = "default_login_state_timeout")]
    pub login_state_timeout: u64,

    /// Most logins that may be awaiting their callback at once.
    #[serde(default = "default_max_pending_logins")]
    pub max_pending_logins: usize,

    /// Interval between expiry sweeps, in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Timeout for each provider HTTP call, in seconds.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout: u64,

    /// Set the Secure flag on the session cookie (requires HTTPS).
    #[serde(default = "default_true")]
    pub secure_cookies: bool,

    #[serde(default)]
    pub github: Option<GitHubSettings>,

    /// Username or email → role.
    #[serde(default)]
    pub role_assignments: HashMap<String, Role>,

    /// Paths reachable without a session. Entries ending in `/` are prefixes.
    #[serde(default)]
    pub public_paths: Vec<String>,

    /// JSON file holding persisted users.
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,

    /// Key material for signing the session cookie.
    #[serde(default)]
    pub session_secret: Option<SecretString>,
}

fn default_role() -> Role {
    Role::Viewer
}

fn default_session_timeout() -> u64 {
    86_400
}

fn default_login_state_timeout() -> u64 {
    600
}

fn default_max_pending_logins() -> usize {
    10_000
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_provider_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_users_file() -> PathBuf {
    PathBuf::from("users.json")
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: ProviderKind::default(),
            default_role: default_role(),
            session_timeout: default_session_timeout(),
            sliding_refresh: true,
            login_state_timeout: default_login_state_timeout(),
            max_pending_logins: default_max_pending_logins(),
            cleanup_interval: default_cleanup_interval(),
            provider_timeout: default_provider_timeout(),
            secure_cookies: true,
            github: None,
            role_assignments: HashMap::new(),
            public_paths: Vec::new(),
            users_file: default_users_file(),
            session_secret: None,
        }
    }
}

impl AuthConfig {
    /// Checks the settings that must hold before the server starts.
    ///
    /// Nothing is checked when authentication is disabled.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` describing the first problem found.
    pub fn validate(&self) -> Result<(), Report<ConfigurationError>> {
        if !self.enabled {
            return Ok(());
        }

        let secret = self
            .session_secret
            .as_ref()
            .ok_or(ConfigurationError::MissingSecret)?;
        if secret.expose_secret().len() < MIN_SECRET_LEN {
            return Err(ConfigurationError::WeakSecret {
                min_len: MIN_SECRET_LEN,
            }
            .into());
        }

        for (setting, value) in [
            ("session_timeout", self.session_timeout),
            ("login_state_timeout", self.login_state_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("provider_timeout", self.provider_timeout),
        ] {
            if value == 0 || value > MAX_DURATION_SECS {
                return Err(ConfigurationError::InvalidDuration {
                    setting: setting.to_string(),
                }
                .into());
            }
        }

        if self.max_pending_logins == 0 {
            return Err(ConfigurationError::InvalidLimit {
                setting: "max_pending_logins".to_string(),
            }
            .into());
        }

        match self.provider {
            ProviderKind::Github => {
                let github =
                    self.github
                        .as_ref()
                        .ok_or_else(|| ConfigurationError::MissingProviderSettings {
                            provider: self.provider.as_str().to_string(),
                        })?;
                if github.client_id.trim().is_empty() {
                    return Err(ConfigurationError::InvalidProviderSettings {
                        provider: self.provider.as_str().to_string(),
                        reason: "client_id is empty".to_string(),
                    }
                    .into());
                }
                if github.redirect_uri.trim().is_empty() {
                    return Err(ConfigurationError::InvalidProviderSettings {
                        provider: self.provider.as_str().to_string(),
                        reason: "redirect_uri is empty".to_string(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Session lifetimes derived from this configuration.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            session_timeout: seconds(self.session_timeout),
            login_state_timeout: seconds(self.login_state_timeout),
            sliding_refresh: self.sliding_refresh,
            max_pending_logins: self.max_pending_logins,
        }
    }

    /// The configured role assignments as a lookup table.
    #[must_use]
    pub fn role_assignments(&self) -> RoleAssignments {
        self.role_assignments
            .iter()
            .map(|(key, role)| (key.as_str(), *role))
            .collect()
    }
}

fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(MAX_DURATION_SECS) as i64)
}
