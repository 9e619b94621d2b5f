//! Administrative endpoints for users, sessions, and role assignments.
//!
//! Every handler here is mounted behind [`guarded`](super::guarded), so the
//! acting user is always present.

use axum::{
    Json,
    extract::{Path, State},
};
use portcullis_access::{AuthStats, Role, RoleAssignments, SessionInfo, User};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

use super::{AppState, CurrentUser};
use crate::error::ApiError;

/// A user with their live sessions.
#[derive(Debug, Serialize)]
pub struct UserEntry {
    #[serde(flatten)]
    pub user: User,
    pub sessions: Vec<SessionInfo>,
}

/// Lists every known user.
pub async fn list_users(State(state): State<AppState>) -> Json<Vec<UserEntry>> {
    let coordinator = &state.coordinator;
    let entries = coordinator
        .users()
        .list_users()
        .into_iter()
        .map(|user| UserEntry {
            sessions: coordinator.sessions().sessions_for_user(user.username()),
            user,
        })
        .collect();
    Json(entries)
}

#[derive(Debug, Deserialize)]
pub struct UpdateUser {
    pub role: Option<Role>,
    pub active: Option<bool>,
}

/// Changes a user's stored role or active flag.
///
/// Deactivating a user also revokes their sessions. A role change applies
/// from the user's next login.
pub async fn update_user(
    State(state): State<AppState>,
    CurrentUser(actor): CurrentUser,
    Path(username): Path<String>,
    Json(update): Json<UpdateUser>,
) -> Result<Json<User>, ApiError> {
    if update.role.is_none() && update.active.is_none() {
        return Err(ApiError::BadRequest {
            reason: "expected 'role' or 'active'".to_string(),
        });
    }
    let users = state.coordinator.users();
    let not_found = || ApiError::NotFound {
        what: format!("user '{username}'"),
    };

    let mut updated = users.get(&username).ok_or_else(not_found)?;
    if let Some(role) = update.role {
        updated = users.set_role(&username, role).ok_or_else(not_found)?;
        info!(actor = %actor.username(), %username, %role, "role changed");
    }
    if let Some(active) = update.active {
        updated = users.set_active(&username, active).ok_or_else(not_found)?;
        info!(actor = %actor.username(), %username, active, "active flag changed");
        if !active {
            let revoked = state.coordinator.sessions().revoke_user(&username);
            info!(%username, revoked, "revoked sessions of deactivated user");
        }
    }
    Ok(Json(updated))
}

/// Revokes every session belonging to a user.
pub async fn revoke_sessions(
    State(state): State<AppState>,
    CurrentUser(actor): CurrentUser,
    Path(username): Path<String>,
) -> Json<serde_json::Value> {
    let revoked = state.coordinator.sessions().revoke_user(&username);
    info!(actor = %actor.username(), %username, revoked, "sessions revoked");
    Json(json!({ "revoked": revoked }))
}

/// Replaces the role assignment table.
pub async fn update_role_assignments(
    State(state): State<AppState>,
    CurrentUser(actor): CurrentUser,
    Json(table): Json<HashMap<String, Role>>,
) -> Json<serde_json::Value> {
    let assignments: RoleAssignments = table.into_iter().collect();
    let size = assignments.len();
    let changed = state.coordinator.update_role_assignments(assignments);
    info!(actor = %actor.username(), assignments = size, changed, "role assignments replaced");
    Json(json!({ "assignments": size, "changed": changed }))
}

pub async fn stats(State(state): State<AppState>) -> Json<AuthStats> {
    Json(state.coordinator.stats())
}
