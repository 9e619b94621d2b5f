//! Pending logins and server-side sessions.
//!
//! The [`SessionManager`] owns two sharded tables: pending logins keyed by
//! their CSRF state token, and active sessions keyed by session id. Both
//! expire lazily on access and are reaped by [`SessionManager::cleanup_expired`].
//!
//! A state token is consumed with an atomic remove, so when two callbacks
//! race on the same token exactly one of them wins.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::borrow::Borrow;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{InvalidStateError, PendingLoginLimitError};
use crate::user::User;

/// Generates an opaque 256-bit token, URL-safe base64 encoded.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Opaque identifier carried in the session cookie.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_token())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Session ids are credentials; keep them out of debug output.
impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionId(..)")
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Single-use CSRF token for one login attempt.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StateToken(String);

impl StateToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_token())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for StateToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateToken(..)")
    }
}

impl Borrow<str> for StateToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifetimes applied by the [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub session_timeout: Duration,
    pub login_state_timeout: Duration,
    /// Push `expires_at` forward on every successful validation.
    pub sliding_refresh: bool,
    /// Upper bound on unexpired pending logins held at once.
    pub max_pending_logins: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_timeout: Duration::seconds(86_400),
            login_state_timeout: Duration::seconds(600),
            sliding_refresh: true,
            max_pending_logins: 10_000,
        }
    }
}

/// A login that has been started but not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Local path to return to after login.
    pub redirect_to: Option<String>,
}

/// An authenticated session.
///
/// Holds a snapshot of the user taken at login; role changes made later
/// apply at the next login.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user: Arc<User>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Session {
    /// A session is expired at and after its expiry instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Non-secret view of a session for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            username: session.user.username().to_string(),
            created_at: session.created_at,
            expires_at: session.expires_at,
            last_seen_at: session.last_seen_at,
        }
    }
}

/// Counts of entries removed by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions: usize,
    pub pending_logins: usize,
}

impl CleanupReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.sessions + self.pending_logins
    }
}

/// Owns pending logins and sessions.
#[derive(Debug)]
pub struct SessionManager {
    settings: SessionSettings,
    clock: Arc<dyn Clock>,
    pending: DashMap<StateToken, PendingLogin>,
    sessions: DashMap<SessionId, Session>,
}

impl SessionManager {
    #[must_use]
    pub fn new(settings: SessionSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            pending: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Creates a manager on the system clock.
    #[must_use]
    pub fn with_settings(settings: SessionSettings) -> Self {
        Self::new(settings, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Records a new pending login and returns its state token.
    ///
    /// When the table is full, expired entries are swept once before
    /// giving up.
    ///
    /// # Errors
    ///
    /// Returns `PendingLoginLimitError` if `max_pending_logins` unexpired
    /// logins are already outstanding.
    pub fn start_login(
        &self,
        redirect_to: Option<String>,
    ) -> Result<StateToken, PendingLoginLimitError> {
        let now = self.clock.now();
        if self.pending.len() >= self.settings.max_pending_logins {
            self.pending.retain(|_, pending| now < pending.expires_at);
            if self.pending.len() >= self.settings.max_pending_logins {
                warn!(
                    limit = self.settings.max_pending_logins,
                    "pending login table is full"
                );
                return Err(PendingLoginLimitError);
            }
        }
        let token = StateToken::generate();
        self.pending.insert(
            token.clone(),
            PendingLogin {
                created_at: now,
                expires_at: now + self.settings.login_state_timeout,
                redirect_to,
            },
        );
        Ok(token)
    }

    /// Claims a pending login.
    ///
    /// The entry is removed before its expiry is checked, so a token can be
    /// claimed at most once whether or not it was still valid.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateError` if the token is unknown, already
    /// consumed, or expired.
    pub fn consume_login(&self, state: &str) -> Result<PendingLogin, InvalidStateError> {
        let (_, pending) = self.pending.remove(state).ok_or(InvalidStateError)?;
        if self.clock.now() >= pending.expires_at {
            debug!("rejected expired login state");
            return Err(InvalidStateError);
        }
        Ok(pending)
    }

    /// Consumes `state` and creates a session for `user`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateError` if the state cannot be consumed; no
    /// session is created in that case.
    pub fn complete_login(&self, state: &str, user: User) -> Result<Session, InvalidStateError> {
        self.consume_login(state)?;
        Ok(self.create_session(user))
    }

    /// Creates and stores a new session.
    pub fn create_session(&self, user: User) -> Session {
        let now = self.clock.now();
        let session = Session {
            id: SessionId::generate(),
            user: Arc::new(user),
            created_at: now,
            expires_at: now + self.settings.session_timeout,
            last_seen_at: now,
        };
        self.sessions.insert(session.id.clone(), session.clone());
        debug!(username = %session.user.username(), "session created");
        session
    }

    /// Returns the session's user if the session exists and has not expired.
    ///
    /// Expired sessions are removed. Valid sessions have `last_seen_at`
    /// stamped and, with sliding refresh, their expiry extended.
    pub fn validate(&self, session_id: &str) -> Option<Arc<User>> {
        let now = self.clock.now();
        {
            let mut entry = self.sessions.get_mut(session_id)?;
            if !entry.is_expired_at(now) {
                entry.last_seen_at = now;
                if self.settings.sliding_refresh {
                    entry.expires_at = now + self.settings.session_timeout;
                }
                return Some(Arc::clone(&entry.user));
            }
        }
        // Guard is dropped; re-check under the shard lock before removing.
        self.sessions
            .remove_if(session_id, |_, session| session.is_expired_at(now));
        debug!("removed expired session on access");
        None
    }

    /// Removes a session. Returns true if it existed.
    pub fn revoke(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Removes every session belonging to `username`. Returns how many.
    pub fn revoke_user(&self, username: &str) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !session.user.username().eq_ignore_ascii_case(username));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(username, removed, "revoked user sessions");
        }
        removed
    }

    /// Returns a non-secret view of a live session.
    #[must_use]
    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let now = self.clock.now();
        self.sessions
            .get(session_id)
            .filter(|session| !session.is_expired_at(now))
            .map(|session| SessionInfo::from(&*session))
    }

    /// Number of unexpired sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        let now = self.clock.now();
        self.sessions
            .iter()
            .filter(|session| !session.is_expired_at(now))
            .count()
    }

    /// Unexpired sessions belonging to `username`.
    #[must_use]
    pub fn sessions_for_user(&self, username: &str) -> Vec<SessionInfo> {
        let now = self.clock.now();
        self.sessions
            .iter()
            .filter(|session| {
                !session.is_expired_at(now) && session.user.username().eq_ignore_ascii_case(username)
            })
            .map(|session| SessionInfo::from(&*session))
            .collect()
    }

    /// Number of unexpired pending logins.
    #[must_use]
    pub fn pending_logins(&self) -> usize {
        let now = self.clock.now();
        self.pending
            .iter()
            .filter(|pending| now < pending.expires_at)
            .count()
    }

    /// Removes every expired session and pending login.
    pub fn cleanup_expired(&self) -> CleanupReport {
        let now = self.clock.now();
        let mut report = CleanupReport::default();
        self.sessions.retain(|_, session| {
            let keep = !session.is_expired_at(now);
            if !keep {
                report.sessions += 1;
            }
            keep
        });
        self.pending.retain(|_, pending| {
            let keep = now < pending.expires_at;
            if !keep {
                report.pending_logins += 1;
            }
            keep
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::permission::Role;
    use crate::user::Identity;

    fn user(name: &str) -> User {
        User::new(Identity::new("github", name, name), Role::Viewer, Utc::now())
    }

    fn manager() -> (SessionManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let settings = SessionSettings {
            session_timeout: Duration::seconds(100),
            login_state_timeout: Duration::seconds(10),
            sliding_refresh: false,
            max_pending_logins: 4,
        };
        (SessionManager::new(settings, clock.clone()), clock)
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        // 32 bytes → 43 base64 characters without padding.
        assert_eq!(a.as_str().len(), 43);
        assert!(!a.as_str().contains('+') && !a.as_str().contains('/'));
        assert_eq!(format!("{a:?}"), "SessionId(..)");
    }

    #[test]
    fn state_is_single_use() {
        let (sessions, _) = manager();
        let state = sessions
            .start_login(Some("/runs".to_string()))
            .expect("room");

        let pending = sessions.consume_login(state.as_str()).expect("first use");
        assert_eq!(pending.redirect_to.as_deref(), Some("/runs"));
        assert_eq!(sessions.consume_login(state.as_str()), Err(InvalidStateError));
        assert_eq!(sessions.consume_login(state.as_str()), Err(InvalidStateError));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let (sessions, _) = manager();
        assert_eq!(sessions.consume_login("forged"), Err(InvalidStateError));
    }

    #[test]
    fn expired_state_is_rejected_and_removed() {
        let (sessions, clock) = manager();
        let state = sessions.start_login(None).expect("room");
        clock.advance(Duration::seconds(10));
        assert_eq!(sessions.consume_login(state.as_str()), Err(InvalidStateError));
        assert_eq!(sessions.pending_logins(), 0);
    }

    #[test]
    fn pending_logins_are_capped() {
        let (sessions, clock) = manager();
        for _ in 0..4 {
            sessions.start_login(None).expect("room");
        }
        assert_eq!(sessions.start_login(None), Err(PendingLoginLimitError));
        assert_eq!(sessions.pending_logins(), 4);

        // Expired entries make room again.
        clock.advance(Duration::seconds(10));
        let state = sessions.start_login(None).expect("swept");
        assert_eq!(sessions.pending_logins(), 1);
        assert!(sessions.consume_login(state.as_str()).is_ok());
    }

    #[test]
    fn complete_login_with_bad_state_creates_no_session() {
        let (sessions, _) = manager();
        assert!(sessions.complete_login("forged", user("eve")).is_err());
        assert_eq!(sessions.active_sessions(), 0);
    }

    #[test]
    fn session_expires_exactly_at_expiry() {
        let (sessions, clock) = manager();
        let session = sessions.create_session(user("alice"));

        clock.advance(Duration::seconds(99));
        assert!(sessions.validate(session.id.as_str()).is_some());

        clock.advance(Duration::seconds(1));
        assert!(sessions.validate(session.id.as_str()).is_none());
        // Lazily removed.
        assert!(sessions.session_info(session.id.as_str()).is_none());
        assert_eq!(sessions.cleanup_expired(), CleanupReport::default());
    }

    #[test]
    fn session_invalid_past_expiry() {
        let (sessions, clock) = manager();
        let session = sessions.create_session(user("alice"));
        clock.advance(Duration::seconds(100) + Duration::milliseconds(1));
        assert!(sessions.validate(session.id.as_str()).is_none());
    }

    #[test]
    fn sliding_refresh_extends_expiry() {
        let clock = Arc::new(ManualClock::default());
        let sessions = SessionManager::new(
            SessionSettings {
                session_timeout: Duration::seconds(100),
                login_state_timeout: Duration::seconds(10),
                sliding_refresh: true,
                ..SessionSettings::default()
            },
            clock.clone(),
        );
        let session = sessions.create_session(user("bob"));

        clock.advance(Duration::seconds(80));
        assert!(sessions.validate(session.id.as_str()).is_some());
        clock.advance(Duration::seconds(80));
        assert!(sessions.validate(session.id.as_str()).is_some());

        let info = sessions
            .session_info(session.id.as_str())
            .expect("still live");
        assert_eq!(info.expires_at, clock.now() + Duration::seconds(100));
        assert_eq!(info.last_seen_at, clock.now());
    }

    #[test]
    fn validate_stamps_last_seen_without_sliding() {
        let (sessions, clock) = manager();
        let session = sessions.create_session(user("carol"));
        clock.advance(Duration::seconds(5));
        sessions.validate(session.id.as_str());

        let info = sessions.session_info(session.id.as_str()).expect("live");
        assert_eq!(info.last_seen_at, clock.now());
        assert_eq!(info.expires_at, session.expires_at);
    }

    #[test]
    fn revoke_is_idempotent() {
        let (sessions, _) = manager();
        let session = sessions.create_session(user("dave"));
        assert!(sessions.revoke(session.id.as_str()));
        assert!(sessions.validate(session.id.as_str()).is_none());
        assert!(!sessions.revoke(session.id.as_str()));
    }

    #[test]
    fn revoke_user_removes_all_their_sessions() {
        let (sessions, _) = manager();
        sessions.create_session(user("erin"));
        sessions.create_session(user("erin"));
        let other = sessions.create_session(user("frank"));

        assert_eq!(sessions.sessions_for_user("erin").len(), 2);
        assert_eq!(sessions.revoke_user("ERIN"), 2);
        assert!(sessions.sessions_for_user("erin").is_empty());
        assert!(sessions.validate(other.id.as_str()).is_some());
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let (sessions, clock) = manager();
        let old = sessions.create_session(user("gina"));
        sessions.start_login(None).expect("room");

        clock.advance(Duration::seconds(50));
        let fresh = sessions.create_session(user("hank"));
        let fresh_state = sessions.start_login(None).expect("room");

        clock.advance(Duration::seconds(50));
        let report = sessions.cleanup_expired();
        assert_eq!(report.sessions, 1);
        assert_eq!(report.pending_logins, 2);
        assert_eq!(report.total(), 3);

        assert!(sessions.validate(old.id.as_str()).is_none());
        assert!(sessions.validate(fresh.id.as_str()).is_some());
        assert!(sessions.consume_login(fresh_state.as_str()).is_err());
    }

    #[test]
    fn concurrent_complete_login_has_one_winner() {
        let sessions = Arc::new(SessionManager::with_settings(SessionSettings::default()));
        let state = sessions.start_login(None).expect("room");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let sessions = Arc::clone(&sessions);
                let state = state.as_str().to_string();
                std::thread::spawn(move || {
                    sessions
                        .complete_login(&state, user(&format!("racer{i}")))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(sessions.active_sessions(), 1);
    }
}
