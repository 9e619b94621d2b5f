//! Authentication module for the portcullis server.
//!
//! This module provides:
//! - `/auth/*` routes for the OAuth login flow and session status
//! - The authentication layer and per-route permission guard
//! - Administrative endpoints for users, sessions, and role assignments
//!
//! # Session Cookie
//!
//! The browser holds only an opaque session id in the `portcullis_session`
//! cookie. The cookie is signed with a key derived from the configured
//! session secret, so a tampered value is dropped before any lookup. The
//! session itself, including the user snapshot and role, lives server-side
//! in the [`SessionManager`](portcullis_access::SessionManager).

pub mod admin;
pub mod middleware;
pub mod routes;

use axum::extract::FromRef;
use axum_extra::extract::cookie::{Cookie, Key, SameSite};
use portcullis_access::config::MIN_SECRET_LEN;
use portcullis_access::{AuthConfig, AuthCoordinator, Session};
use secrecy::ExposeSecret;
use std::sync::Arc;
use time::Duration as TimeDuration;

pub use middleware::{CurrentUser, MaybeUser, authenticate, guarded};

/// Session cookie name.
pub const SESSION_COOKIE: &str = "portcullis_session";

/// Where API callers are told to log in.
pub const LOGIN_URL: &str = "/auth/login";

/// Attributes applied to the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieSettings {
    pub secure: bool,
    pub max_age_seconds: i64,
}

impl CookieSettings {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            secure: config.secure_cookies,
            max_age_seconds: config.session_settings().session_timeout.num_seconds(),
        }
    }

    /// Builds the cookie carrying `session`'s id.
    #[must_use]
    pub fn session_cookie(&self, session: &Session) -> Cookie<'static> {
        self.cookie_for(session.id.as_str())
    }

    /// Builds a session cookie for a raw session id, used to re-issue it.
    #[must_use]
    pub fn cookie_for(&self, session_id: &str) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, session_id.to_string()))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(TimeDuration::seconds(self.max_age_seconds))
            .build()
    }

    /// Builds a cookie that clears the session cookie.
    #[must_use]
    pub fn removal_cookie(&self) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, ""))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(TimeDuration::ZERO)
            .build()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<AuthCoordinator>,
    pub cookie_key: Key,
    pub cookies: CookieSettings,
}

impl AppState {
    /// Creates state for `coordinator`, deriving the cookie key from the
    /// configured secret.
    ///
    /// Without a usable secret (authentication disabled) a random key is
    /// used.
    #[must_use]
    pub fn new(coordinator: Arc<AuthCoordinator>, config: &AuthConfig) -> Self {
        let cookie_key = config
            .session_secret
            .as_ref()
            .map(|secret| secret.expose_secret().as_bytes())
            .filter(|secret| secret.len() >= MIN_SECRET_LEN)
            .map_or_else(Key::generate, Key::derive_from);
        Self {
            coordinator,
            cookie_key,
            cookies: CookieSettings::from_config(config),
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}
