//! Policy enforcement: turning an authentication result and a required
//! permission into a decision.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::coordinator::{AuthResult, LoginRedirect};
use crate::error::AuthorizationError;
use crate::permission::{Permission, PermissionSet, Role, has_permission, permissions_for};
use crate::user::User;

/// What to do with a request.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Proceed. Carries the user for non-public paths.
    Allow(Option<Arc<User>>),
    /// Send the caller to log in. Carries the redirect for browser requests.
    Login(Option<LoginRedirect>),
    /// Authenticated, but the role lacks the permission.
    Forbidden,
}

/// Decides whether `result` may perform an operation gated by `permission`.
#[must_use]
pub fn authorize(result: &AuthResult, permission: Permission) -> Decision {
    match result {
        AuthResult::Public => Decision::Allow(None),
        AuthResult::Authenticated(user) if has_permission(user, permission) => {
            Decision::Allow(Some(Arc::clone(user)))
        }
        AuthResult::Authenticated(_) => Decision::Forbidden,
        AuthResult::Unauthenticated => Decision::Login(None),
        AuthResult::RequiresRedirect(redirect) => Decision::Login(Some(redirect.clone())),
    }
}

/// Whether a permission is enabled for a user, and why not if it isn't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionResult {
    pub enabled: bool,
    pub message: String,
}

/// Permission queries for an optional user.
#[derive(Debug, Clone)]
pub struct PermissionChecker {
    user: Option<Arc<User>>,
}

impl PermissionChecker {
    #[must_use]
    pub fn new(user: Option<Arc<User>>) -> Self {
        Self { user }
    }

    #[must_use]
    pub fn user(&self) -> Option<&User> {
        self.user.as_deref()
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.user.as_ref().map(|u| u.role())
    }

    #[must_use]
    pub fn can(&self, permission: Permission) -> bool {
        self.user
            .as_deref()
            .is_some_and(|user| has_permission(user, permission))
    }

    /// Like [`PermissionChecker::can`], but explains a denial.
    ///
    /// # Errors
    ///
    /// Returns `NotAuthenticated` without a user and `PermissionDenied` when
    /// the role lacks `permission`.
    pub fn require(&self, permission: Permission) -> Result<(), AuthorizationError> {
        let user = self
            .user
            .as_deref()
            .ok_or(AuthorizationError::NotAuthenticated)?;
        if has_permission(user, permission) {
            Ok(())
        } else {
            Err(AuthorizationError::PermissionDenied {
                username: user.username().to_string(),
                permission,
            })
        }
    }

    /// Checks a permission given by name. Unknown names are denied.
    #[must_use]
    pub fn can_named(&self, permission: &str) -> bool {
        permission.parse().is_ok_and(|p| self.can(p))
    }

    /// Every permission the user holds; empty without an active user.
    #[must_use]
    pub fn permissions(&self) -> PermissionSet {
        match self.user.as_deref() {
            Some(user) if user.is_active() => permissions_for(user.role()),
            _ => PermissionSet::EMPTY,
        }
    }

    #[must_use]
    pub fn can_manage_schedules(&self) -> bool {
        self.can(Permission::StartSchedules) && self.can(Permission::StopSchedules)
    }

    #[must_use]
    pub fn can_manage_sensors(&self) -> bool {
        self.can(Permission::StartSensors) && self.can(Permission::StopSensors)
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role().is_some_and(Role::is_admin)
    }

    /// True when the user cannot launch anything, including when there is
    /// no user at all.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        !self.role().is_some_and(|role| role.at_least(Role::Launcher))
    }

    /// Per-permission status for UI rendering.
    #[must_use]
    pub fn summary(&self) -> BTreeMap<Permission, PermissionResult> {
        Permission::ALL
            .into_iter()
            .map(|permission| {
                let result = match self.user.as_deref() {
                    None => PermissionResult {
                        enabled: false,
                        message: "Authentication required".to_string(),
                    },
                    Some(user) if has_permission(user, permission) => PermissionResult {
                        enabled: true,
                        message: String::new(),
                    },
                    Some(user) => PermissionResult {
                        enabled: false,
                        message: format!("Role '{}' does not have this permission", user.role()),
                    },
                };
                (permission, result)
            })
            .collect()
    }

    /// Tags identifying the viewer on launched runs.
    #[must_use]
    pub fn viewer_tags(&self) -> BTreeMap<&'static str, String> {
        let Some(user) = self.user.as_deref() else {
            return BTreeMap::new();
        };
        let mut tags = BTreeMap::from([
            ("portcullis.user.username", user.username().to_string()),
            ("portcullis.user.role", user.role().to_string()),
            ("portcullis.user.provider", user.identity().provider.clone()),
        ]);
        if let Some(email) = user.email() {
            tags.insert("portcullis.user.email", email.to_string());
        }
        tags
    }
}

impl From<&AuthResult> for PermissionChecker {
    fn from(result: &AuthResult) -> Self {
        Self::new(result.user().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Identity;
    use chrono::Utc;

    fn user(role: Role) -> Arc<User> {
        Arc::new(User::new(
            Identity::new("github", "1", "octocat").with_email("octocat@github.com"),
            role,
            Utc::now(),
        ))
    }

    fn redirect() -> LoginRedirect {
        LoginRedirect {
            authorization_url: "https://provider.test/authorize?state=s".to_string(),
            state: "s".to_string(),
        }
    }

    #[test]
    fn public_is_allowed_anonymously() {
        assert!(matches!(
            authorize(&AuthResult::Public, Permission::ManageUsers),
            Decision::Allow(None)
        ));
    }

    #[test]
    fn authenticated_with_permission_is_allowed() {
        let result = AuthResult::Authenticated(user(Role::Launcher));
        let Decision::Allow(Some(allowed)) = authorize(&result, Permission::LaunchRuns) else {
            panic!("expected allow");
        };
        assert_eq!(allowed.username(), "octocat");
    }

    #[test]
    fn insufficient_role_is_forbidden_not_redirected() {
        let result = AuthResult::Authenticated(user(Role::Viewer));
        assert!(matches!(
            authorize(&result, Permission::LaunchRuns),
            Decision::Forbidden
        ));
    }

    #[test]
    fn unauthenticated_needs_login() {
        assert!(matches!(
            authorize(&AuthResult::Unauthenticated, Permission::ViewRuns),
            Decision::Login(None)
        ));
        let Decision::Login(Some(r)) = authorize(
            &AuthResult::RequiresRedirect(redirect()),
            Permission::ViewRuns,
        ) else {
            panic!("expected login redirect");
        };
        assert_eq!(r.state, "s");
    }

    #[test]
    fn checker_helpers_by_role() {
        let viewer = PermissionChecker::new(Some(user(Role::Viewer)));
        assert!(viewer.is_read_only());
        assert!(!viewer.can_manage_schedules());
        assert!(!viewer.is_admin());
        assert_eq!(viewer.permissions().len(), 7);

        let editor = PermissionChecker::new(Some(user(Role::Editor)));
        assert!(!editor.is_read_only());
        assert!(editor.can_manage_schedules());
        assert!(editor.can_manage_sensors());
        assert!(!editor.can(Permission::ManageUsers));

        let admin = PermissionChecker::new(Some(user(Role::Admin)));
        assert!(admin.is_admin());
        assert_eq!(admin.permissions().len(), 22);
    }

    #[test]
    fn anonymous_checker_denies_everything() {
        let checker = PermissionChecker::new(None);
        assert!(checker.is_read_only());
        assert!(checker.permissions().is_empty());
        assert_eq!(
            checker.require(Permission::ViewRuns),
            Err(AuthorizationError::NotAuthenticated)
        );
        assert!(
            checker
                .summary()
                .values()
                .all(|r| !r.enabled && r.message == "Authentication required")
        );
        assert!(checker.viewer_tags().is_empty());
    }

    #[test]
    fn unknown_permission_names_are_denied() {
        let checker = PermissionChecker::new(Some(user(Role::Admin)));
        assert!(checker.can_named("manage_users"));
        assert!(!checker.can_named("launch_rockets"));
    }

    #[test]
    fn require_names_missing_permission() {
        let checker = PermissionChecker::new(Some(user(Role::Viewer)));
        let err = checker
            .require(Permission::DeleteRuns)
            .expect_err("viewer cannot delete");
        assert!(err.to_string().contains("delete_runs"));
    }

    #[test]
    fn summary_explains_denials() {
        let summary = PermissionChecker::new(Some(user(Role::Launcher))).summary();
        assert_eq!(summary.len(), 22);
        assert!(summary[&Permission::LaunchRuns].enabled);
        let denied = &summary[&Permission::StartSchedules];
        assert!(!denied.enabled);
        assert_eq!(denied.message, "Role 'launcher' does not have this permission");
    }

    #[test]
    fn viewer_tags_include_identity() {
        let tags = PermissionChecker::new(Some(user(Role::Editor))).viewer_tags();
        assert_eq!(tags["portcullis.user.username"], "octocat");
        assert_eq!(tags["portcullis.user.role"], "editor");
        assert_eq!(tags["portcullis.user.email"], "octocat@github.com");
    }
}
