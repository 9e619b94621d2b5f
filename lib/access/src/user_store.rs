//! User cache, role resolution, and persistence.
//!
//! The [`UserStore`] keeps every known user in memory and writes changes
//! through a [`UserRepository`]. Reads never touch the repository; writes
//! are serialized on a dedicated lock so the backing file sees one writer at
//! a time.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rootcause::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ConfigurationError, StoreError};
use crate::permission::Role;
use crate::user::{Identity, User};

/// Explicit identity → role assignments from configuration.
///
/// Keys are usernames or email addresses, matched without regard to ASCII
/// case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleAssignments {
    entries: HashMap<String, Role>,
}

impl RoleAssignments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an assignment.
    pub fn insert(&mut self, key: impl AsRef<str>, role: Role) {
        self.entries.insert(key.as_ref().to_ascii_lowercase(), role);
    }

    /// Looks up the role assigned to `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Role> {
        self.entries.get(&key.to_ascii_lowercase()).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the explicit assignment for `identity`: username first, then
    /// email.
    #[must_use]
    pub fn lookup(&self, identity: &Identity) -> Option<Role> {
        self.get(&identity.username)
            .or_else(|| identity.email.as_deref().and_then(|email| self.get(email)))
    }
}

impl<K: AsRef<str>> FromIterator<(K, Role)> for RoleAssignments {
    fn from_iter<I: IntoIterator<Item = (K, Role)>>(iter: I) -> Self {
        let mut assignments = Self::new();
        for (key, role) in iter {
            assignments.insert(key, role);
        }
        assignments
    }
}

/// Backing storage for user records.
pub trait UserRepository: Send + Sync {
    /// Loads every persisted user.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store exists but cannot be read or
    /// parsed.
    fn load_all(&self) -> Result<Vec<User>, Report<StoreError>>;

    /// Inserts or replaces a user, keyed by username.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn upsert(&self, user: &User) -> Result<(), Report<StoreError>>;

    /// Describes where users are stored, for error messages.
    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// Key under which a user is persisted. Usernames are case-insensitive.
fn storage_key(user: &User) -> String {
    user.username().to_ascii_lowercase()
}

/// Persists users as a JSON object keyed by lowercased username.
///
/// A missing file is treated as an empty store. Writes go to a sibling
/// temporary file which is then renamed over the original.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, err: &std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            reason: err.to_string(),
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, User>, Report<StoreError>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_error(&e).into()),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|e| {
            StoreError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn write_map(&self, users: &BTreeMap<String, User>) -> Result<(), Report<StoreError>> {
        let json = serde_json::to_string_pretty(users).map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(&e))?;
        }
        std::fs::write(&tmp, json).map_err(|e| self.io_error(&e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(&e))?;
        Ok(())
    }
}

impl UserRepository for JsonFileRepository {
    fn load_all(&self) -> Result<Vec<User>, Report<StoreError>> {
        Ok(self.read_map()?.into_values().collect())
    }

    fn upsert(&self, user: &User) -> Result<(), Report<StoreError>> {
        let mut users = self.read_map()?;
        let key = storage_key(user);
        users.retain(|existing, _| !existing.eq_ignore_ascii_case(&key));
        users.insert(key, user.clone());
        self.write_map(&users)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Keeps users in memory only.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    users: Mutex<BTreeMap<String, User>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository pre-populated with `users`.
    #[must_use]
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let users = users
            .into_iter()
            .map(|user| (storage_key(&user), user))
            .collect();
        Self {
            users: Mutex::new(users),
        }
    }
}

impl UserRepository for MemoryRepository {
    fn load_all(&self) -> Result<Vec<User>, Report<StoreError>> {
        Ok(self.users.lock().values().cloned().collect())
    }

    fn upsert(&self, user: &User) -> Result<(), Report<StoreError>> {
        self.users.lock().insert(storage_key(user), user.clone());
        Ok(())
    }
}

/// In-memory user cache with write-through persistence.
pub struct UserStore {
    default_role: Role,
    assignments: RwLock<Arc<RoleAssignments>>,
    users: RwLock<HashMap<String, User>>,
    repository: Arc<dyn UserRepository>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for UserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStore")
            .field("default_role", &self.default_role)
            .field("users", &self.users.read().len())
            .finish_non_exhaustive()
    }
}

impl UserStore {
    /// Loads every persisted user from `repository`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::UserStoreUnreadable` if the repository
    /// cannot be read.
    pub fn open(
        repository: Arc<dyn UserRepository>,
        assignments: RoleAssignments,
        default_role: Role,
    ) -> Result<Self, Report<ConfigurationError>> {
        let loaded = repository.load_all().map_err(|report| {
            warn!(error = %report, "failed to load user store");
            ConfigurationError::UserStoreUnreadable {
                path: repository.location(),
            }
        })?;

        let users: HashMap<String, User> = loaded
            .into_iter()
            .map(|user| (user.username().to_ascii_lowercase(), user))
            .collect();
        info!(users = users.len(), "loaded user store");

        Ok(Self {
            default_role,
            assignments: RwLock::new(Arc::new(assignments)),
            users: RwLock::new(users),
            repository,
            write_lock: Mutex::new(()),
        })
    }

    /// Creates an empty store backed by memory.
    #[must_use]
    pub fn in_memory(assignments: RoleAssignments, default_role: Role) -> Self {
        Self {
            default_role,
            assignments: RwLock::new(Arc::new(assignments)),
            users: RwLock::new(HashMap::new()),
            repository: Arc::new(MemoryRepository::new()),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn default_role(&self) -> Role {
        self.default_role
    }

    /// Returns the current assignment table.
    #[must_use]
    pub fn assignments(&self) -> Arc<RoleAssignments> {
        Arc::clone(&self.assignments.read())
    }

    /// Resolves the role for `identity` from explicit assignments, falling
    /// back to the default role.
    #[must_use]
    pub fn resolve_role(&self, identity: &Identity) -> Role {
        self.assignments()
            .lookup(identity)
            .unwrap_or(self.default_role)
    }

    /// Records a successful login and returns the stored user.
    ///
    /// Role priority: explicit assignment, then the previously stored role,
    /// then the default. A persistence failure is logged and the in-memory
    /// record is still returned.
    pub fn record_login(&self, identity: Identity) -> User {
        let _write = self.write_lock.lock();
        let now = Utc::now();
        let assigned = self.assignments().lookup(&identity);
        let key = identity.username.to_ascii_lowercase();

        let user = {
            let mut users = self.users.write();
            let mut user = match users.remove(&key) {
                Some(mut existing) => {
                    existing.refresh_identity(identity);
                    if let Some(role) = assigned {
                        existing.set_role(role);
                    }
                    existing
                }
                None => {
                    let role = assigned.unwrap_or(self.default_role);
                    info!(username = %identity.username, %role, "first login, creating user");
                    User::new(identity, role, now)
                }
            };
            user.record_login(now);
            users.insert(key, user.clone());
            user
        };

        self.persist(&user);
        user
    }

    /// Swaps in a new assignment table and re-applies it to known users.
    ///
    /// Returns the number of users whose role changed.
    pub fn reload_assignments(&self, assignments: RoleAssignments) -> usize {
        let _write = self.write_lock.lock();
        let assignments = Arc::new(assignments);
        *self.assignments.write() = Arc::clone(&assignments);

        let changed: Vec<User> = {
            let mut users = self.users.write();
            users
                .values_mut()
                .filter_map(|user| {
                    let role = assignments.lookup(user.identity())?;
                    (role != user.role()).then(|| {
                        user.set_role(role);
                        user.clone()
                    })
                })
                .collect()
        };

        for user in &changed {
            self.persist(user);
        }
        info!(
            assignments = assignments.len(),
            changed = changed.len(),
            "reloaded role assignments"
        );
        changed.len()
    }

    /// Looks up a user by username.
    #[must_use]
    pub fn get(&self, username: &str) -> Option<User> {
        self.users.read().get(&username.to_ascii_lowercase()).cloned()
    }

    /// Returns every known user, sorted by username.
    #[must_use]
    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.username().cmp(b.username()));
        users
    }

    /// Returns users holding exactly `role`.
    #[must_use]
    pub fn users_with_role(&self, role: Role) -> Vec<User> {
        self.list_users()
            .into_iter()
            .filter(|user| user.role() == role)
            .collect()
    }

    /// Counts users per role. Roles with no users are reported as zero.
    #[must_use]
    pub fn count_by_role(&self) -> BTreeMap<Role, usize> {
        let mut counts: BTreeMap<Role, usize> = Role::ALL.into_iter().map(|r| (r, 0)).collect();
        for user in self.users.read().values() {
            *counts.entry(user.role()).or_default() += 1;
        }
        counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Changes a known user's role. Returns the updated user, or `None` if
    /// the user is unknown.
    pub fn set_role(&self, username: &str, role: Role) -> Option<User> {
        self.update(username, |user| user.set_role(role))
    }

    /// Activates or deactivates a known user.
    pub fn set_active(&self, username: &str, active: bool) -> Option<User> {
        self.update(username, |user| user.set_active(active))
    }

    /// Returns whether `username` is known and active.
    #[must_use]
    pub fn is_active(&self, username: &str) -> bool {
        self.users
            .read()
            .get(&username.to_ascii_lowercase())
            .is_some_and(User::is_active)
    }

    fn update(&self, username: &str, apply: impl FnOnce(&mut User)) -> Option<User> {
        let _write = self.write_lock.lock();
        let user = {
            let mut users = self.users.write();
            let user = users.get_mut(&username.to_ascii_lowercase())?;
            apply(user);
            user.clone()
        };
        self.persist(&user);
        Some(user)
    }

    fn persist(&self, user: &User) {
        match self.repository.upsert(user) {
            Ok(()) => debug!(username = %user.username(), "persisted user"),
            Err(report) => {
                warn!(username = %user.username(), error = %report, "failed to persist user");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(username: &str) -> Identity {
        Identity::new("github", format!("id-{username}"), username)
    }

    fn store_with(assignments: RoleAssignments) -> UserStore {
        UserStore::in_memory(assignments, Role::Viewer)
    }

    #[test]
    fn resolve_role_prefers_explicit_assignment() {
        let store = store_with([("admin-user", Role::Admin)].into_iter().collect());
        assert_eq!(store.resolve_role(&identity("admin-user")), Role::Admin);
        assert_eq!(store.resolve_role(&identity("unknown-user")), Role::Viewer);
    }

    #[test]
    fn resolve_role_matches_email_after_username() {
        let store = store_with(
            [("ops@example.com", Role::Editor), ("alice", Role::Launcher)]
                .into_iter()
                .collect(),
        );
        let by_email = identity("bob").with_email("OPS@example.com");
        assert_eq!(store.resolve_role(&by_email), Role::Editor);

        let both = identity("alice").with_email("ops@example.com");
        assert_eq!(store.resolve_role(&both), Role::Launcher);
    }

    #[test]
    fn resolve_role_is_case_insensitive() {
        let store = store_with([("Admin-User", Role::Admin)].into_iter().collect());
        assert_eq!(store.resolve_role(&identity("admin-user")), Role::Admin);
        assert_eq!(store.resolve_role(&identity("ADMIN-USER")), Role::Admin);
    }

    #[test]
    fn record_login_creates_then_updates() {
        let store = store_with(RoleAssignments::new());
        let first = store.record_login(identity("carol"));
        assert_eq!(first.role(), Role::Viewer);
        assert!(first.last_login().is_some());
        assert_eq!(store.len(), 1);

        let second = store.record_login(identity("carol").with_email("carol@example.com"));
        assert_eq!(second.email(), Some("carol@example.com"));
        assert_eq!(second.created_at(), first.created_at());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn record_login_keeps_stored_role_without_assignment() {
        let store = store_with(RoleAssignments::new());
        store.record_login(identity("dave"));
        store.set_role("dave", Role::Editor);

        let user = store.record_login(identity("dave"));
        assert_eq!(user.role(), Role::Editor);
    }

    #[test]
    fn record_login_assignment_overrides_stored_role() {
        let store = store_with([("erin", Role::Admin)].into_iter().collect());
        store.record_login(identity("erin"));
        store.set_role("erin", Role::Viewer);

        let user = store.record_login(identity("erin"));
        assert_eq!(user.role(), Role::Admin);
    }

    #[test]
    fn reload_assignments_reapplies_to_known_users() {
        let store = store_with(RoleAssignments::new());
        store.record_login(identity("frank"));
        store.record_login(identity("grace"));

        let changed = store.reload_assignments([("frank", Role::Launcher)].into_iter().collect());
        assert_eq!(changed, 1);
        assert_eq!(store.get("frank").map(|u| u.role()), Some(Role::Launcher));
        assert_eq!(store.get("grace").map(|u| u.role()), Some(Role::Viewer));
        assert_eq!(store.resolve_role(&identity("frank")), Role::Launcher);
    }

    #[test]
    fn admin_queries() {
        let store = store_with([("heidi", Role::Admin)].into_iter().collect());
        store.record_login(identity("heidi"));
        store.record_login(identity("ivan"));
        store.record_login(identity("judy"));

        assert_eq!(store.users_with_role(Role::Viewer).len(), 2);
        let counts = store.count_by_role();
        assert_eq!(counts[&Role::Admin], 1);
        assert_eq!(counts[&Role::Viewer], 2);
        assert_eq!(counts[&Role::Editor], 0);

        let names: Vec<_> = store
            .list_users()
            .iter()
            .map(|u| u.username().to_string())
            .collect();
        assert_eq!(names, vec!["heidi", "ivan", "judy"]);
    }

    #[test]
    fn set_active_toggles_and_unknown_is_none() {
        let store = store_with(RoleAssignments::new());
        store.record_login(identity("kim"));
        assert!(store.is_active("kim"));

        store.set_active("kim", false);
        assert!(!store.is_active("kim"));
        assert!(!store.is_active("nobody"));
        assert!(store.set_active("nobody", true).is_none());
    }

    #[test]
    fn json_repository_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.json");
        let repository: Arc<dyn UserRepository> = Arc::new(JsonFileRepository::new(&path));

        let store = UserStore::open(Arc::clone(&repository), RoleAssignments::new(), Role::Viewer)
            .expect("open empty store");
        assert!(store.is_empty());
        store.record_login(identity("leo"));
        store.set_role("leo", Role::Editor);

        let raw = std::fs::read_to_string(&path).expect("file written");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(parsed["leo"]["role"], "editor");

        let reopened =
            UserStore::open(repository, RoleAssignments::new(), Role::Viewer).expect("reopen");
        assert_eq!(reopened.get("leo").map(|u| u.role()), Some(Role::Editor));
    }

    #[test]
    fn json_repository_replaces_case_variants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.json");
        std::fs::write(
            &path,
            r#"{ "Octocat": { "provider": "github", "provider_id": "1", "username": "Octocat",
                             "role": "viewer", "created_at": "2024-01-01T00:00:00Z" } }"#,
        )
        .expect("write legacy file");
        let repository: Arc<dyn UserRepository> = Arc::new(JsonFileRepository::new(&path));

        let store = UserStore::open(Arc::clone(&repository), RoleAssignments::new(), Role::Viewer)
            .expect("open");
        store.set_role("octocat", Role::Editor);
        store.record_login(Identity::new("github", "1", "OCTOCAT"));

        let raw = std::fs::read_to_string(&path).expect("file written");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        let keys: Vec<&String> = parsed.as_object().expect("object").keys().collect();
        assert_eq!(keys, vec!["octocat"]);
        assert_eq!(parsed["octocat"]["username"], "OCTOCAT");

        let reopened =
            UserStore::open(repository, RoleAssignments::new(), Role::Viewer).expect("reopen");
        assert_eq!(reopened.len(), 1);
        let user = reopened.get("octocat").expect("user");
        assert_eq!(user.username(), "OCTOCAT");
        assert_eq!(user.role(), Role::Editor);
    }

    #[test]
    fn malformed_store_fails_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{ not json").expect("write");

        let result = UserStore::open(
            Arc::new(JsonFileRepository::new(&path)),
            RoleAssignments::new(),
            Role::Viewer,
        );
        let err = result.expect_err("malformed store must not open");
        assert!(err.to_string().contains("could not be read"));
    }

    #[test]
    fn unreadable_store_fails_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory cannot be read as a file.
        let result = UserStore::open(
            Arc::new(JsonFileRepository::new(dir.path())),
            RoleAssignments::new(),
            Role::Viewer,
        );
        assert!(result.is_err());
    }

    struct FailingRepository;

    impl UserRepository for FailingRepository {
        fn load_all(&self) -> Result<Vec<User>, Report<StoreError>> {
            Ok(Vec::new())
        }

        fn upsert(&self, _user: &User) -> Result<(), Report<StoreError>> {
            Err(StoreError::Io {
                path: "nowhere".to_string(),
                reason: "disk full".to_string(),
            }
            .into())
        }
    }

    #[test]
    fn persistence_failure_does_not_fail_login() {
        let store = UserStore::open(
            Arc::new(FailingRepository),
            RoleAssignments::new(),
            Role::Launcher,
        )
        .expect("open");
        let user = store.record_login(identity("mallory"));
        assert_eq!(user.role(), Role::Launcher);
        assert!(store.get("mallory").is_some());
    }
}
