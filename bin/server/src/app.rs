//! Router assembly.

use axum::{
    Json, Router,
    middleware::from_fn_with_state,
    routing::{delete, get, put},
};
use portcullis_access::{Permission, PermissionChecker};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::{self, AppState, CurrentUser, admin, guarded, routes};

/// Builds the application router.
///
/// `/health` is only reachable without a session when listed in
/// `auth.public_paths`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", guarded(get(home), Permission::ViewWorkspace))
        .route("/health", get(health))
        .route(
            "/api/permissions",
            guarded(get(permissions), Permission::ViewWorkspace),
        )
        // Auth routes
        .route("/auth/login", get(routes::login))
        .route("/auth/callback", get(routes::callback))
        .route("/auth/logout", get(routes::logout).post(routes::logout))
        .route("/auth/user", get(routes::current_user))
        .route("/auth/status", get(routes::status))
        // Administration
        .route(
            "/auth/admin/users",
            guarded(get(admin::list_users), Permission::ManageUsers),
        )
        .route(
            "/auth/admin/users/{username}",
            guarded(put(admin::update_user), Permission::ManageUsers),
        )
        .route(
            "/auth/admin/users/{username}/sessions",
            guarded(delete(admin::revoke_sessions), Permission::ManageUsers),
        )
        .route(
            "/auth/admin/role-assignments",
            guarded(
                put(admin::update_role_assignments),
                Permission::ManagePermissions,
            ),
        )
        .route(
            "/auth/admin/stats",
            guarded(get(admin::stats), Permission::ViewInstanceConfig),
        )
        .layer(from_fn_with_state(state.clone(), auth::authenticate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn home(CurrentUser(user): CurrentUser) -> Json<serde_json::Value> {
    let checker = PermissionChecker::new(Some(user));
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "user": checker.user(),
        "tags": checker.viewer_tags(),
    }))
}

async fn health() -> &'static str {
    "ok"
}

/// Permission summary for UI gating.
async fn permissions(CurrentUser(user): CurrentUser) -> Json<serde_json::Value> {
    let checker = PermissionChecker::new(Some(user));
    Json(json!({
        "role": checker.role(),
        "read_only": checker.is_read_only(),
        "permissions": checker.summary(),
    }))
}
