//! Authentication, sessions, and role-based authorization for portcullis.
//!
//! This crate provides:
//! - The static role → permission table (`Role`, `Permission`, `PermissionSet`)
//! - User records with identity → role resolution (`UserStore`)
//! - OAuth provider backends (`OAuthProvider`, `GitHubProvider`)
//! - Pending-login and session lifecycle (`SessionManager`)
//! - The login flow and per-request decision (`AuthCoordinator`)
//! - Policy enforcement (`authorize`, `PermissionChecker`)
//!
//! # Access Control Model
//!
//! Roles are strictly ordered, `Viewer < Launcher < Editor < Admin`, and each
//! role holds every permission of the roles below it. A user's role is
//! resolved at login from explicit assignments (username, then email), then
//! the role previously stored for them, then the configured default.
//! Sessions keep the role they were created with.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use portcullis_access::{Identity, Permission, Role, User, has_permission, permissions_for};
//!
//! assert!(permissions_for(Role::Viewer).is_subset(permissions_for(Role::Editor)));
//!
//! let user = User::new(Identity::new("github", "583231", "octocat"), Role::Launcher, Utc::now());
//! assert!(has_permission(&user, Permission::LaunchRuns));
//! assert!(!has_permission(&user, Permission::StartSchedules));
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod permission;
pub mod policy;
pub mod provider;
pub mod session;
pub mod user;
pub mod user_store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, GitHubSettings, ProviderKind};
pub use coordinator::{
    AuthCoordinator, AuthRequest, AuthResult, AuthStats, LoginRedirect, LoginSuccess, PublicPaths,
    sanitize_redirect,
};
pub use error::{
    AuthenticationError, AuthorizationError, ConfigurationError, InvalidStateError,
    PendingLoginLimitError, ProviderError, StoreError,
};
pub use permission::{
    Permission, PermissionSet, Role, has_permission, permissions_for, role_at_least,
};
pub use policy::{Decision, PermissionChecker, PermissionResult, authorize};
pub use provider::{GitHubEndpoints, GitHubProvider, OAuthProvider};
pub use session::{Session, SessionId, SessionInfo, SessionManager, SessionSettings};
pub use user::{Identity, User};
pub use user_store::{JsonFileRepository, MemoryRepository, RoleAssignments, UserRepository, UserStore};
