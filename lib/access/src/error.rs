//! Error types for the access crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ConfigurationError`: Fatal startup problems (missing secret, bad provider settings)
//! - `InvalidStateError`: A login callback carried an unknown, reused, or expired state
//! - `PendingLoginLimitError`: Too many logins are already in flight
//! - `ProviderError`: Failures talking to the OAuth provider
//! - `StoreError`: Failures reading or writing persisted users
//! - `AuthenticationError`: Login-flow failures surfaced to the HTTP edge
//! - `AuthorizationError`: Permission check failures

use crate::permission::Permission;
use std::fmt;

/// Errors that must stop the process from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Authentication is enabled but no session secret was supplied.
    MissingSecret,
    /// The session secret is too short to derive a signing key from.
    WeakSecret { min_len: usize },
    /// The selected provider has no settings block.
    MissingProviderSettings { provider: String },
    /// The provider settings are present but unusable.
    InvalidProviderSettings { provider: String, reason: String },
    /// A duration setting is zero or out of range.
    InvalidDuration { setting: String },
    /// A capacity setting is zero.
    InvalidLimit { setting: String },
    /// The persisted user store exists but could not be read.
    UserStoreUnreadable { path: String },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSecret => {
                write!(f, "authentication is enabled but no session secret is set")
            }
            Self::WeakSecret { min_len } => {
                write!(f, "session secret must be at least {min_len} bytes")
            }
            Self::MissingProviderSettings { provider } => {
                write!(f, "no settings configured for provider '{provider}'")
            }
            Self::InvalidProviderSettings { provider, reason } => {
                write!(f, "invalid settings for provider '{provider}': {reason}")
            }
            Self::InvalidDuration { setting } => {
                write!(f, "'{setting}' must be a positive number of seconds")
            }
            Self::InvalidLimit { setting } => write!(f, "'{setting}' must be at least 1"),
            Self::UserStoreUnreadable { path } => {
                write!(f, "user store at '{path}' could not be read")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// A login callback presented a state token that cannot be accepted.
///
/// Deliberately carries no detail: unknown, consumed, and expired tokens
/// are indistinguishable to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidStateError;

impl fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid login state")
    }
}

impl std::error::Error for InvalidStateError {}

/// The pending login table is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLoginLimitError;

impl fmt::Display for PendingLoginLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "too many pending logins")
    }
}

impl std::error::Error for PendingLoginLimitError {}

/// Errors from talking to an OAuth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The HTTP client could not be built or the request could not be sent.
    Http { reason: String },
    /// The provider rejected the authorization code or returned garbage.
    TokenExchange { reason: String },
    /// The identity endpoint failed or returned an unusable profile.
    Identity { reason: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { reason } => write!(f, "provider HTTP error: {reason}"),
            Self::TokenExchange { reason } => write!(f, "token exchange failed: {reason}"),
            Self::Identity { reason } => write!(f, "identity lookup failed: {reason}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors from the persisted user store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    Io { path: String, reason: String },
    /// The backing data could not be (de)serialized.
    Serialization { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, reason } => write!(f, "user store I/O error at '{path}': {reason}"),
            Self::Serialization { reason } => {
                write!(f, "user store serialization error: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the login flow.
///
/// Every variant is rendered to end users as the same generic failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The callback state was unknown, reused, or expired.
    InvalidState,
    /// The provider exchange or identity lookup failed.
    ProviderExchange { provider: String },
    /// The user exists but has been deactivated by an administrator.
    AccountDeactivated { username: String },
    /// Authentication is turned off; there is no login flow.
    Disabled,
    /// No new login can be started until pending ones complete or expire.
    TooManyPendingLogins,
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState => write!(f, "login callback rejected: invalid state"),
            Self::ProviderExchange { provider } => {
                write!(f, "login with provider '{provider}' failed")
            }
            Self::AccountDeactivated { username } => {
                write!(f, "account '{username}' is deactivated")
            }
            Self::Disabled => write!(f, "authentication is disabled"),
            Self::TooManyPendingLogins => write!(f, "too many logins in progress"),
        }
    }
}

impl std::error::Error for AuthenticationError {}

impl From<InvalidStateError> for AuthenticationError {
    fn from(_: InvalidStateError) -> Self {
        Self::InvalidState
    }
}

impl From<PendingLoginLimitError> for AuthenticationError {
    fn from(_: PendingLoginLimitError) -> Self {
        Self::TooManyPendingLogins
    }
}

/// Errors from permission checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    /// No authenticated user is attached to the request.
    NotAuthenticated,
    /// The user's role does not grant the permission.
    PermissionDenied {
        username: String,
        permission: Permission,
    },
}

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "user is not authenticated"),
            Self::PermissionDenied {
                username,
                permission,
            } => {
                write!(f, "user {username} lacks permission '{permission}'")
            }
        }
    }
}

impl std::error::Error for AuthorizationError {}
