//! Roles, permissions, and the static role → permission table.
//!
//! Roles form a strict hierarchy: every role holds all permissions of the
//! roles below it. The table is built at compile time and never changes at
//! runtime; only the identity → role assignment is mutable.

use crate::user::User;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Access level assigned to a user.
///
/// Ordered by level: `Viewer < Launcher < Editor < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Read-only access to runs, assets, schedules, and logs.
    Viewer = 1,
    /// Viewer plus launching, terminating, and re-executing runs.
    Launcher = 2,
    /// Launcher plus schedule, sensor, and workspace management.
    Editor = 3,
    /// Everything, including user and instance administration.
    Admin = 4,
}

impl Role {
    /// All roles in ascending order.
    pub const ALL: [Role; 4] = [Role::Viewer, Role::Launcher, Role::Editor, Role::Admin];

    /// Returns the numeric hierarchy level.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    /// Returns the lowercase name used in configuration and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Launcher => "launcher",
            Self::Editor => "editor",
            Self::Admin => "admin",
        }
    }

    /// Returns true if this role is at or above `threshold`.
    #[must_use]
    pub const fn at_least(self, threshold: Role) -> bool {
        self.level() >= threshold.level()
    }

    /// Returns true if this role grants `permission`.
    #[must_use]
    pub const fn grants(self, permission: Permission) -> bool {
        permissions_for(self).contains(permission)
    }

    /// Returns true if this is the admin role.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role or permission name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNameError {
    /// What kind of name failed to parse.
    pub kind: &'static str,
    /// The rejected input.
    pub name: String,
}

impl fmt::Display for UnknownNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: '{}'", self.kind, self.name)
    }
}

impl std::error::Error for UnknownNameError {}

impl FromStr for Role {
    type Err = UnknownNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownNameError {
                kind: "role",
                name: s.to_string(),
            })
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A single capability gating one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Permission {
    ViewRuns,
    ViewAssets,
    ViewSchedules,
    ViewSensors,
    ViewJobs,
    ViewLogs,
    ViewWorkspace,
    LaunchRuns,
    TerminateRuns,
    DeleteRuns,
    ReexecuteRuns,
    StartSchedules,
    StopSchedules,
    StartSensors,
    StopSensors,
    UpdateWorkspace,
    ManageBackfills,
    ManageUsers,
    ManagePermissions,
    ViewInstanceConfig,
    ManageInstanceConfig,
    AccessAllLocations,
}

impl Permission {
    /// Every permission, in declaration order.
    pub const ALL: [Permission; 22] = [
        Permission::ViewRuns,
        Permission::ViewAssets,
        Permission::ViewSchedules,
        Permission::ViewSensors,
        Permission::ViewJobs,
        Permission::ViewLogs,
        Permission::ViewWorkspace,
        Permission::LaunchRuns,
        Permission::TerminateRuns,
        Permission::DeleteRuns,
        Permission::ReexecuteRuns,
        Permission::StartSchedules,
        Permission::StopSchedules,
        Permission::StartSensors,
        Permission::StopSensors,
        Permission::UpdateWorkspace,
        Permission::ManageBackfills,
        Permission::ManageUsers,
        Permission::ManagePermissions,
        Permission::ViewInstanceConfig,
        Permission::ManageInstanceConfig,
        Permission::AccessAllLocations,
    ];

    /// Returns the snake_case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ViewRuns => "view_runs",
            Self::ViewAssets => "view_assets",
            Self::ViewSchedules => "view_schedules",
            Self::ViewSensors => "view_sensors",
            Self::ViewJobs => "view_jobs",
            Self::ViewLogs => "view_logs",
            Self::ViewWorkspace => "view_workspace",
            Self::LaunchRuns => "launch_runs",
            Self::TerminateRuns => "terminate_runs",
            Self::DeleteRuns => "delete_runs",
            Self::ReexecuteRuns => "reexecute_runs",
            Self::StartSchedules => "start_schedules",
            Self::StopSchedules => "stop_schedules",
            Self::StartSensors => "start_sensors",
            Self::StopSensors => "stop_sensors",
            Self::UpdateWorkspace => "update_workspace",
            Self::ManageBackfills => "manage_backfills",
            Self::ManageUsers => "manage_users",
            Self::ManagePermissions => "manage_permissions",
            Self::ViewInstanceConfig => "view_instance_config",
            Self::ManageInstanceConfig => "manage_instance_config",
            Self::AccessAllLocations => "access_all_locations",
        }
    }

    const fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = UnknownNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .into_iter()
            .find(|permission| permission.as_str() == s)
            .ok_or_else(|| UnknownNameError {
                kind: "permission",
                name: s.to_string(),
            })
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A fixed-size set of permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PermissionSet(u32);

impl PermissionSet {
    /// The empty set.
    pub const EMPTY: PermissionSet = PermissionSet(0);

    /// Builds a set from a slice at compile time.
    #[must_use]
    pub const fn from_slice(permissions: &[Permission]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < permissions.len() {
            bits |= permissions[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Returns the union of two sets.
    #[must_use]
    pub const fn union(self, other: PermissionSet) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    /// Returns true if every permission in `self` is also in `other`.
    #[must_use]
    pub const fn is_subset(self, other: PermissionSet) -> bool {
        self.0 & !other.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Permission> {
        Permission::ALL
            .into_iter()
            .filter(move |permission| self.contains(*permission))
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().fold(0, |bits, p| bits | p.bit()))
    }
}

impl Serialize for PermissionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

const VIEWER: PermissionSet = PermissionSet::from_slice(&[
    Permission::ViewRuns,
    Permission::ViewAssets,
    Permission::ViewSchedules,
    Permission::ViewSensors,
    Permission::ViewJobs,
    Permission::ViewLogs,
    Permission::ViewWorkspace,
]);

const LAUNCHER: PermissionSet = VIEWER.union(PermissionSet::from_slice(&[
    Permission::LaunchRuns,
    Permission::TerminateRuns,
    Permission::DeleteRuns,
    Permission::ReexecuteRuns,
]));

const EDITOR: PermissionSet = LAUNCHER.union(PermissionSet::from_slice(&[
    Permission::StartSchedules,
    Permission::StopSchedules,
    Permission::StartSensors,
    Permission::StopSensors,
    Permission::UpdateWorkspace,
    Permission::ManageBackfills,
]));

const ADMIN: PermissionSet = EDITOR.union(PermissionSet::from_slice(&[
    Permission::ManageUsers,
    Permission::ManagePermissions,
    Permission::ViewInstanceConfig,
    Permission::ManageInstanceConfig,
    Permission::AccessAllLocations,
]));

/// Returns the full permission set held by `role`.
#[must_use]
pub const fn permissions_for(role: Role) -> PermissionSet {
    match role {
        Role::Viewer => VIEWER,
        Role::Launcher => LAUNCHER,
        Role::Editor => EDITOR,
        Role::Admin => ADMIN,
    }
}

/// Returns true iff `user` is active and their role grants `permission`.
#[must_use]
pub fn has_permission(user: &User, permission: Permission) -> bool {
    user.is_active() && permissions_for(user.role()).contains(permission)
}

/// Returns true if `role` is at or above `threshold` in the hierarchy.
#[must_use]
pub const fn role_at_least(role: Role, threshold: Role) -> bool {
    role.at_least(threshold)
}
