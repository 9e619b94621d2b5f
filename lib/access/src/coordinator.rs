//! Ties the provider, session manager, and user store into one login flow
//! and one per-request authentication decision.

use rootcause::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::{AuthenticationError, ConfigurationError};
use crate::permission::Role;
use crate::provider::{self, OAuthProvider};
use crate::session::{Session, SessionManager};
use crate::user::User;
use crate::user_store::{JsonFileRepository, RoleAssignments, UserStore};

/// Auth endpoints that must always be reachable without a session.
const BUILTIN_PUBLIC_PATHS: &[&str] = &[
    "/auth/login",
    "/auth/callback",
    "/auth/logout",
    "/auth/user",
    "/auth/status",
    "/favicon.ico",
    "/robots.txt",
];

const BUILTIN_PUBLIC_PREFIXES: &[&str] = &["/static/"];

/// Paths that bypass authentication.
///
/// Configured entries ending in `/` match as prefixes; everything else
/// matches exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicPaths {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl PublicPaths {
    /// Built-in public paths plus `configured`.
    #[must_use]
    pub fn new(configured: &[String]) -> Self {
        let mut paths = Self {
            exact: BUILTIN_PUBLIC_PATHS.iter().map(ToString::to_string).collect(),
            prefixes: BUILTIN_PUBLIC_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
        };
        for entry in configured.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            if entry.ends_with('/') {
                paths.prefixes.push(entry.to_string());
            } else {
                paths.exact.push(entry.to_string());
            }
        }
        paths
    }

    #[must_use]
    pub fn is_public(&self, path: &str) -> bool {
        self.exact.iter().any(|p| p == path)
            || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// What the coordinator needs to know about an incoming request.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub path: &'a str,
    /// Path and query to come back to after login. Falls back to `path`.
    pub return_to: Option<&'a str>,
    /// Value of the session cookie, already signature-checked.
    pub session_id: Option<&'a str>,
    /// True for browser navigation, false for API/JSON callers.
    pub interactive: bool,
}

/// Where to send the browser to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub authorization_url: String,
    pub state: String,
}

/// Outcome of authenticating one request.
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// The path needs no authentication.
    Public,
    Authenticated(Arc<User>),
    /// No valid session, and the caller cannot follow a redirect.
    Unauthenticated,
    /// No valid session; a login has been started.
    RequiresRedirect(LoginRedirect),
}

impl AuthResult {
    #[must_use]
    pub fn user(&self) -> Option<&Arc<User>> {
        match self {
            Self::Authenticated(user) => Some(user),
            _ => None,
        }
    }
}

/// A completed login.
#[derive(Debug, Clone)]
pub struct LoginSuccess {
    pub session: Session,
    /// Local path to send the browser to.
    pub redirect_to: String,
}

/// Point-in-time counters for the admin stats endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthStats {
    pub enabled: bool,
    pub provider: Option<String>,
    pub active_sessions: usize,
    pub pending_logins: usize,
    pub total_users: usize,
    pub users_by_role: BTreeMap<Role, usize>,
}

/// Returns `target` if it is a local absolute path, otherwise `None`.
///
/// Rejects scheme-relative (`//host`) and backslash forms that browsers
/// treat as off-site.
#[must_use]
pub fn sanitize_redirect(target: Option<&str>) -> Option<String> {
    let target = target?.trim();
    let local = target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains('\\')
        && !target.chars().any(char::is_control);
    local.then(|| target.to_string())
}

/// Coordinates login, session validation, and logout.
#[derive(Debug)]
pub struct AuthCoordinator {
    enabled: bool,
    provider: Option<Arc<dyn OAuthProvider>>,
    sessions: Arc<SessionManager>,
    users: Arc<UserStore>,
    public_paths: PublicPaths,
    system_user: Arc<User>,
}

impl AuthCoordinator {
    /// A coordinator that admits every request as the `system` admin.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            provider: None,
            sessions: Arc::new(SessionManager::with_settings(Default::default())),
            users: Arc::new(UserStore::in_memory(RoleAssignments::new(), Role::Viewer)),
            public_paths: PublicPaths::new(&[]),
            system_user: Arc::new(User::system()),
        }
    }

    /// An enabled coordinator over explicit components.
    #[must_use]
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        sessions: Arc<SessionManager>,
        users: Arc<UserStore>,
        public_paths: PublicPaths,
    ) -> Self {
        Self {
            enabled: true,
            provider: Some(provider),
            sessions,
            users,
            public_paths,
            system_user: Arc::new(User::system()),
        }
    }

    /// Builds every component from configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if the configuration is invalid, the
    /// provider cannot be built, or the user store cannot be read.
    pub fn from_config(
        config: &AuthConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Report<ConfigurationError>> {
        if !config.enabled {
            info!("authentication disabled, all requests run as the system user");
            return Ok(Self::disabled());
        }
        config.validate()?;

        let provider = provider::from_config(config)?;
        let users = UserStore::open(
            Arc::new(JsonFileRepository::new(&config.users_file)),
            config.role_assignments(),
            config.default_role,
        )?;
        let sessions = SessionManager::new(config.session_settings(), clock);

        info!(
            provider = provider.name(),
            default_role = %config.default_role,
            users = users.len(),
            "authentication enabled"
        );
        Ok(Self::new(
            provider,
            Arc::new(sessions),
            Arc::new(users),
            PublicPaths::new(&config.public_paths),
        ))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    #[must_use]
    pub fn public_paths(&self) -> &PublicPaths {
        &self.public_paths
    }

    /// Decides who, if anyone, is making `request`.
    pub fn authenticate(&self, request: &AuthRequest<'_>) -> AuthResult {
        if !self.enabled {
            return AuthResult::Authenticated(Arc::clone(&self.system_user));
        }
        if self.public_paths.is_public(request.path) {
            return AuthResult::Public;
        }
        if let Some(user) = request.session_id.and_then(|id| self.current_user(id)) {
            return AuthResult::Authenticated(user);
        }
        if !request.interactive {
            return AuthResult::Unauthenticated;
        }
        match self.start_login(Some(request.return_to.unwrap_or(request.path))) {
            Ok(redirect) => AuthResult::RequiresRedirect(redirect),
            Err(report) => {
                warn!(error = %report, "could not start login");
                AuthResult::Unauthenticated
            }
        }
    }

    /// Returns the live user behind `session_id`.
    ///
    /// A session whose user has since been deactivated or removed is
    /// revoked.
    pub fn current_user(&self, session_id: &str) -> Option<Arc<User>> {
        if !self.enabled {
            return Some(Arc::clone(&self.system_user));
        }
        let user = self.sessions.validate(session_id)?;
        if self.users.is_active(user.username()) {
            Some(user)
        } else {
            info!(username = %user.username(), "revoking session of inactive user");
            self.sessions.revoke(session_id);
            None
        }
    }

    /// Starts a login that returns to `redirect_to` when complete.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationError::Disabled` when there is no provider and
    /// `TooManyPendingLogins` when the pending login table is full.
    pub fn start_login(
        &self,
        redirect_to: Option<&str>,
    ) -> Result<LoginRedirect, Report<AuthenticationError>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or(AuthenticationError::Disabled)?;
        let state = self
            .sessions
            .start_login(sanitize_redirect(redirect_to))
            .map_err(AuthenticationError::from)?;
        Ok(LoginRedirect {
            authorization_url: provider.authorization_url(state.as_str()),
            state: state.as_str().to_string(),
        })
    }

    /// Completes a login from the provider callback.
    ///
    /// The state is consumed before any network call, so a replayed or
    /// forged callback never reaches the provider.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for an unknown, reused, or expired state,
    /// `ProviderExchange` if the provider rejects the code or the identity
    /// lookup fails, and `AccountDeactivated` for a deactivated user.
    #[instrument(skip_all)]
    pub async fn complete_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<LoginSuccess, Report<AuthenticationError>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or(AuthenticationError::Disabled)?;
        let pending = self.sessions.consume_login(state).map_err(|e| {
            debug!("login callback carried an invalid state");
            AuthenticationError::from(e)
        })?;

        let exchange_failed = || AuthenticationError::ProviderExchange {
            provider: provider.name().to_string(),
        };
        let token = provider
            .exchange_code(code, state)
            .await
            .context(exchange_failed())?;
        let identity = provider
            .fetch_identity(&token)
            .await
            .context(exchange_failed())?;

        if self
            .users
            .get(&identity.username)
            .is_some_and(|existing| !existing.is_active())
        {
            info!(username = %identity.username, "rejected login of deactivated user");
            return Err(AuthenticationError::AccountDeactivated {
                username: identity.username,
            }
            .into());
        }

        let user = self.users.record_login(identity);

        let session = self.sessions.create_session(user);
        info!(
            username = %session.user.username(),
            role = %session.user.role(),
            provider = provider.name(),
            "login completed"
        );
        Ok(LoginSuccess {
            session,
            redirect_to: pending.redirect_to.unwrap_or_else(|| "/".to_string()),
        })
    }

    /// Ends a session. Returns true if it existed.
    pub fn logout(&self, session_id: &str) -> bool {
        let revoked = self.sessions.revoke(session_id);
        if revoked {
            debug!("session revoked on logout");
        }
        revoked
    }

    /// Replaces the role assignment table. Returns how many users changed.
    pub fn update_role_assignments(&self, assignments: RoleAssignments) -> usize {
        self.users.reload_assignments(assignments)
    }

    #[must_use]
    pub fn stats(&self) -> AuthStats {
        AuthStats {
            enabled: self.enabled,
            provider: self.provider.as_ref().map(|p| p.name().to_string()),
            active_sessions: self.sessions.active_sessions(),
            pending_logins: self.sessions.pending_logins(),
            total_users: self.users.len(),
            users_by_role: self.users.count_by_role(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::SessionSettings;
    use crate::testing::StaticProvider;
    use crate::user::Identity;
    use chrono::Duration;

    struct Harness {
        coordinator: AuthCoordinator,
        clock: Arc<ManualClock>,
    }

    fn harness_with(provider: StaticProvider, assignments: RoleAssignments) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let sessions = SessionManager::new(
            SessionSettings {
                session_timeout: Duration::seconds(3600),
                login_state_timeout: Duration::seconds(60),
                sliding_refresh: true,
                max_pending_logins: 8,
            },
            clock.clone(),
        );
        let coordinator = AuthCoordinator::new(
            Arc::new(provider),
            Arc::new(sessions),
            Arc::new(UserStore::in_memory(assignments, Role::Viewer)),
            PublicPaths::new(&["/health".to_string(), "/docs/".to_string()]),
        );
        Harness { coordinator, clock }
    }

    fn harness() -> Harness {
        harness_with(
            StaticProvider::new()
                .with_code("good", Identity::new("static", "1", "octocat"))
                .with_code("admin", Identity::new("static", "2", "admin-user")),
            [("admin-user", Role::Admin)].into_iter().collect(),
        )
    }

    fn request<'a>(path: &'a str, session_id: Option<&'a str>, interactive: bool) -> AuthRequest<'a> {
        AuthRequest {
            path,
            return_to: None,
            session_id,
            interactive,
        }
    }

    async fn login(h: &Harness, code: &str) -> LoginSuccess {
        let redirect = h.coordinator.start_login(Some("/runs")).expect("start");
        h.coordinator
            .complete_callback(code, &redirect.state)
            .await
            .expect("login")
    }

    #[test]
    fn public_paths_match_exact_and_prefix() {
        let paths = PublicPaths::new(&["/health".to_string(), "/docs/".to_string()]);
        assert!(paths.is_public("/auth/login"));
        assert!(paths.is_public("/health"));
        assert!(!paths.is_public("/health/deep"));
        assert!(paths.is_public("/docs/intro"));
        assert!(paths.is_public("/static/app.js"));
        assert!(!paths.is_public("/runs"));
    }

    #[test]
    fn sanitize_redirect_keeps_local_paths_only() {
        assert_eq!(sanitize_redirect(Some("/runs?x=1")), Some("/runs?x=1".to_string()));
        assert_eq!(sanitize_redirect(Some("https://evil.example")), None);
        assert_eq!(sanitize_redirect(Some("//evil.example")), None);
        assert_eq!(sanitize_redirect(Some("/\\evil.example")), None);
        assert_eq!(sanitize_redirect(Some("runs")), None);
        assert_eq!(sanitize_redirect(None), None);
    }

    #[test]
    fn disabled_admits_everything_as_system_admin() {
        let coordinator = AuthCoordinator::disabled();
        let result = coordinator.authenticate(&request("/runs", None, false));
        let user = result.user().expect("system user");
        assert_eq!(user.username(), "system");
        assert_eq!(user.role(), Role::Admin);
        assert!(coordinator.start_login(None).is_err());
    }

    #[test]
    fn public_path_needs_no_session() {
        let h = harness();
        assert!(matches!(
            h.coordinator.authenticate(&request("/health", None, true)),
            AuthResult::Public
        ));
    }

    #[test]
    fn unauthenticated_api_request_gets_no_redirect() {
        let h = harness();
        assert!(matches!(
            h.coordinator.authenticate(&request("/api/runs", None, false)),
            AuthResult::Unauthenticated
        ));
        assert_eq!(h.coordinator.stats().pending_logins, 0);
    }

    #[test]
    fn unauthenticated_browser_request_starts_login() {
        let h = harness();
        let result = h.coordinator.authenticate(&request("/runs", Some("bogus"), true));
        let AuthResult::RequiresRedirect(redirect) = result else {
            panic!("expected redirect, got {result:?}");
        };
        assert!(redirect.authorization_url.contains(&redirect.state));
        assert_eq!(h.coordinator.stats().pending_logins, 1);
    }

    #[tokio::test]
    async fn login_returns_to_path_and_query() {
        let h = harness();
        let result = h.coordinator.authenticate(&AuthRequest {
            path: "/runs",
            return_to: Some("/runs?status=failed&page=2"),
            session_id: None,
            interactive: true,
        });
        let AuthResult::RequiresRedirect(redirect) = result else {
            panic!("expected redirect, got {result:?}");
        };
        let success = h
            .coordinator
            .complete_callback("good", &redirect.state)
            .await
            .expect("login");
        assert_eq!(success.redirect_to, "/runs?status=failed&page=2");
    }

    #[test]
    fn full_pending_table_degrades_to_unauthenticated() {
        let h = harness();
        for _ in 0..8 {
            assert!(matches!(
                h.coordinator.authenticate(&request("/runs", None, true)),
                AuthResult::RequiresRedirect(_)
            ));
        }
        assert!(matches!(
            h.coordinator.authenticate(&request("/runs", None, true)),
            AuthResult::Unauthenticated
        ));
        let err = h.coordinator.start_login(None).expect_err("full");
        assert!(matches!(
            err.current_context(),
            AuthenticationError::TooManyPendingLogins
        ));
        assert_eq!(h.coordinator.stats().pending_logins, 8);

        h.clock.advance(Duration::seconds(60));
        assert!(h.coordinator.start_login(None).is_ok());
    }

    #[tokio::test]
    async fn full_login_flow() {
        let h = harness();
        let success = login(&h, "good").await;
        assert_eq!(success.redirect_to, "/runs");
        assert_eq!(success.session.user.role(), Role::Viewer);

        let result = h
            .coordinator
            .authenticate(&request("/runs", Some(success.session.id.as_str()), true));
        assert_eq!(result.user().map(|u| u.username()), Some("octocat"));
    }

    #[tokio::test]
    async fn assigned_role_applies_at_login() {
        let h = harness();
        let success = login(&h, "admin").await;
        assert_eq!(success.session.user.role(), Role::Admin);
    }

    #[tokio::test]
    async fn state_cannot_be_replayed() {
        let h = harness();
        let redirect = h.coordinator.start_login(None).expect("start");
        h.coordinator
            .complete_callback("good", &redirect.state)
            .await
            .expect("first callback");

        let err = h
            .coordinator
            .complete_callback("good", &redirect.state)
            .await
            .expect_err("replay");
        assert!(err.to_string().contains("invalid state"));
    }

    #[tokio::test]
    async fn expired_state_is_rejected() {
        let h = harness();
        let redirect = h.coordinator.start_login(None).expect("start");
        h.clock.advance(Duration::seconds(61));
        assert!(
            h.coordinator
                .complete_callback("good", &redirect.state)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn provider_failure_consumes_state_and_creates_no_session() {
        let h = harness();
        let redirect = h.coordinator.start_login(None).expect("start");
        let err = h
            .coordinator
            .complete_callback("unknown-code", &redirect.state)
            .await
            .expect_err("bad code");
        assert!(err.to_string().contains("login with provider 'static' failed"));
        assert_eq!(h.coordinator.stats().active_sessions, 0);
        assert_eq!(h.coordinator.stats().pending_logins, 0);
    }

    #[tokio::test]
    async fn identity_failure_is_provider_exchange_error() {
        let h = harness_with(
            StaticProvider::new()
                .with_code("good", Identity::new("static", "1", "octocat"))
                .failing_identity(),
            RoleAssignments::new(),
        );
        let redirect = h.coordinator.start_login(None).expect("start");
        assert!(
            h.coordinator
                .complete_callback("good", &redirect.state)
                .await
                .is_err()
        );
        assert!(h.coordinator.users().is_empty());
    }

    #[tokio::test]
    async fn role_change_does_not_affect_live_session() {
        let h = harness();
        let success = login(&h, "good").await;
        h.coordinator.users().set_role("octocat", Role::Editor);

        let user = h
            .coordinator
            .current_user(success.session.id.as_str())
            .expect("live");
        assert_eq!(user.role(), Role::Viewer);

        let again = login(&h, "good").await;
        assert_eq!(again.session.user.role(), Role::Editor);
    }

    #[tokio::test]
    async fn deactivated_user_loses_session_and_cannot_log_in() {
        let h = harness();
        let success = login(&h, "good").await;
        h.coordinator.users().set_active("octocat", false);

        assert!(
            h.coordinator
                .current_user(success.session.id.as_str())
                .is_none()
        );
        assert!(!h.coordinator.sessions().revoke(success.session.id.as_str()));

        let before = h.coordinator.users().get("octocat").expect("stored");
        h.clock.advance(Duration::seconds(5));
        let redirect = h.coordinator.start_login(None).expect("start");
        let err = h
            .coordinator
            .complete_callback("good", &redirect.state)
            .await
            .expect_err("deactivated");
        assert!(err.to_string().contains("deactivated"));

        let after = h.coordinator.users().get("octocat").expect("stored");
        assert_eq!(after.last_login(), before.last_login());
        assert!(!after.is_active());
        assert_eq!(h.coordinator.sessions().active_sessions(), 0);
    }

    #[tokio::test]
    async fn logout_revokes() {
        let h = harness();
        let success = login(&h, "good").await;
        let id = success.session.id.as_str();
        assert!(h.coordinator.logout(id));
        assert!(h.coordinator.current_user(id).is_none());
        assert!(!h.coordinator.logout(id));
    }

    #[tokio::test]
    async fn stats_and_role_reload() {
        let h = harness();
        login(&h, "good").await;
        login(&h, "admin").await;

        let stats = h.coordinator.stats();
        assert!(stats.enabled);
        assert_eq!(stats.provider.as_deref(), Some("static"));
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.users_by_role[&Role::Admin], 1);

        let changed = h
            .coordinator
            .update_role_assignments([("octocat", Role::Launcher)].into_iter().collect());
        assert_eq!(changed, 1);
        assert_eq!(
            h.coordinator.users().get("octocat").map(|u| u.role()),
            Some(Role::Launcher)
        );
    }

    #[test]
    fn from_config_disabled() {
        let coordinator =
            AuthCoordinator::from_config(&AuthConfig::default(), Arc::new(ManualClock::default()))
                .expect("disabled config");
        assert!(!coordinator.is_enabled());
    }

    #[test]
    fn from_config_missing_secret_fails() {
        let config = AuthConfig {
            enabled: true,
            ..AuthConfig::default()
        };
        let err = AuthCoordinator::from_config(&config, Arc::new(ManualClock::default()))
            .expect_err("no secret");
        assert!(err.to_string().contains("session secret"));
    }
}
