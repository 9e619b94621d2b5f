//! OAuth login flow and session status endpoints.
//!
//! All of these paths are public. The authentication layer only supplies a
//! user here when authentication is disabled; otherwise the session cookie
//! is resolved directly.

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::SignedCookieJar;
use portcullis_access::{PermissionChecker, User, sanitize_redirect};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::{AppState, MaybeUser, middleware::session_id};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    next: Option<String>,
}

/// Query parameters the provider appends to the callback URL.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

fn session_user(
    state: &AppState,
    jar: &SignedCookieJar,
    MaybeUser(layer_user): MaybeUser,
) -> Option<Arc<User>> {
    layer_user.or_else(|| session_id(jar).and_then(|id| state.coordinator.current_user(&id)))
}

/// Starts the OAuth flow, or skips it for a user who is already signed in.
pub async fn login(
    State(state): State<AppState>,
    maybe_user: MaybeUser,
    jar: SignedCookieJar,
    Query(query): Query<LoginQuery>,
) -> Result<Redirect, ApiError> {
    if session_user(&state, &jar, maybe_user).is_some() {
        let target = sanitize_redirect(query.next.as_deref()).unwrap_or_else(|| "/".to_string());
        return Ok(Redirect::to(&target));
    }

    let redirect = state
        .coordinator
        .start_login(query.next.as_deref())
        .map_err(|report| {
            warn!(error = %report, "could not start login");
            ApiError::LoginFailed
        })?;
    Ok(Redirect::to(&redirect.authorization_url))
}

/// Handles the provider redirect, creating a session on success.
pub async fn callback(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(error) = &query.error {
        info!(%error, "provider returned an error to the callback");
        return Err(ApiError::LoginFailed);
    }
    let (Some(code), Some(login_state)) = (query.code.as_deref(), query.state.as_deref()) else {
        info!("callback missing code or state");
        return Err(ApiError::LoginFailed);
    };

    let success = state
        .coordinator
        .complete_callback(code, login_state)
        .await
        .map_err(|report| {
            warn!(error = %report, "login failed");
            ApiError::LoginFailed
        })?;

    // A fresh id is issued on every login; drop any session the browser
    // was still carrying.
    if let Some(previous) = session_id(&jar) {
        state.coordinator.logout(&previous);
    }

    let jar = jar.add(state.cookies.session_cookie(&success.session));
    Ok((jar, Redirect::to(&success.redirect_to)).into_response())
}

/// Revokes the current session and clears the cookie.
pub async fn logout(State(state): State<AppState>, jar: SignedCookieJar) -> impl IntoResponse {
    if let Some(id) = session_id(&jar) {
        state.coordinator.logout(&id);
    }
    let jar = jar.add(state.cookies.removal_cookie());
    (jar, Redirect::to("/"))
}

/// Returns the signed-in user with their effective permissions.
pub async fn current_user(
    State(state): State<AppState>,
    maybe_user: MaybeUser,
    jar: SignedCookieJar,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = session_user(&state, &jar, maybe_user).ok_or(ApiError::Unauthenticated)?;
    let checker = PermissionChecker::new(Some(Arc::clone(&user)));
    Ok(Json(json!({
        "user": user.as_ref(),
        "permissions": checker.permissions(),
    })))
}

/// Reports whether authentication is on and who, if anyone, is signed in.
pub async fn status(
    State(state): State<AppState>,
    maybe_user: MaybeUser,
    jar: SignedCookieJar,
) -> Json<serde_json::Value> {
    let user = session_user(&state, &jar, maybe_user);
    Json(json!({
        "enabled": state.coordinator.is_enabled(),
        "authenticated": user.is_some(),
        "user": user.as_deref(),
    }))
}
