//! Authentication layer, permission guard, and extractors for Axum.
//!
//! [`authenticate`] runs on every request. It resolves the session cookie
//! through the coordinator and either short-circuits (401 or a redirect to
//! the provider) or stores the [`AuthResult`] in the request extensions.
//! [`guarded`] then checks a route's required permission against it.
//!
//! Only `GET` and `HEAD` navigations are sent to the provider; any other
//! unauthenticated request gets a 401 and leaves no pending login behind.
//! With sliding sessions the cookie is re-issued on each authenticated
//! response so its `Max-Age` keeps pace with the server-side expiry.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        HeaderMap, Method,
        header::{ACCEPT, SET_COOKIE},
        request::Parts,
    },
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::MethodRouter,
};
use axum_extra::extract::SignedCookieJar;
use portcullis_access::{AuthRequest, AuthResult, Decision, Permission, User, authorize};
use std::sync::Arc;
use tracing::{debug, info};

use super::{AppState, SESSION_COOKIE};
use crate::error::ApiError;

/// Returns true for callers that expect JSON rather than a redirect.
#[must_use]
pub fn is_api_request(path: &str, headers: &HeaderMap) -> bool {
    path.starts_with("/api/")
        || path.starts_with("/graphql")
        || headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("application/json"))
}

/// Returns true when an unauthenticated request may be redirected to log in.
#[must_use]
pub fn starts_login(method: &Method, path: &str, headers: &HeaderMap) -> bool {
    (*method == Method::GET || *method == Method::HEAD) && !is_api_request(path, headers)
}

/// Reads the verified session id from the signed cookie, if any.
#[must_use]
pub fn session_id(jar: &SignedCookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|cookie| cookie.value().to_string())
}

/// Authentication layer. Install with `axum::middleware::from_fn_with_state`.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let jar = SignedCookieJar::from_headers(request.headers(), state.cookie_key.clone());
    let session_id = session_id(&jar);
    let path = request.uri().path().to_string();
    let return_to = request
        .uri()
        .path_and_query()
        .map(|target| target.as_str().to_string());
    let interactive = starts_login(request.method(), &path, request.headers());

    let result = state.coordinator.authenticate(&AuthRequest {
        path: &path,
        return_to: return_to.as_deref(),
        session_id: session_id.as_deref(),
        interactive,
    });

    match result {
        AuthResult::Public => {
            request.extensions_mut().insert(result);
            next.run(request).await
        }
        AuthResult::Authenticated(_) => {
            let sliding = state.coordinator.is_enabled()
                && state.coordinator.sessions().settings().sliding_refresh;
            request.extensions_mut().insert(result);
            let response = next.run(request).await;
            match session_id {
                Some(id) if sliding && !response.headers().contains_key(SET_COOKIE) => {
                    (jar.add(state.cookies.cookie_for(&id)), response).into_response()
                }
                _ => response,
            }
        }
        AuthResult::Unauthenticated => {
            debug!(%path, "unauthenticated request");
            ApiError::Unauthenticated.into_response()
        }
        AuthResult::RequiresRedirect(redirect) => {
            debug!(%path, "redirecting to login");
            Redirect::to(&redirect.authorization_url).into_response()
        }
    }
}

/// Requires `permission` for every method on `route`.
pub fn guarded<S>(route: MethodRouter<S>, permission: Permission) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    route.route_layer(middleware::from_fn_with_state(permission, enforce_permission))
}

async fn enforce_permission(
    State(permission): State<Permission>,
    request: Request,
    next: Next,
) -> Response {
    let Some(result) = request.extensions().get::<AuthResult>() else {
        return ApiError::Unauthenticated.into_response();
    };

    match authorize(result, permission) {
        Decision::Allow(_) => next.run(request).await,
        Decision::Forbidden => {
            if let Some(user) = result.user() {
                info!(username = %user.username(), role = %user.role(), %permission, "permission denied");
            }
            ApiError::Forbidden.into_response()
        }
        Decision::Login(Some(redirect)) => Redirect::to(&redirect.authorization_url).into_response(),
        Decision::Login(None) => ApiError::Unauthenticated.into_response(),
    }
}

/// Extractor for the authenticated user set by [`authenticate`].
///
/// Rejects with 401 on public paths or when the layer is not installed.
pub struct CurrentUser(pub Arc<User>);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthResult>()
            .and_then(AuthResult::user)
            .map(|user| CurrentUser(Arc::clone(user)))
            .ok_or(ApiError::Unauthenticated)
    }
}

/// Extractor for optionally getting the authenticated user.
pub struct MaybeUser(pub Option<Arc<User>>);

impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match CurrentUser::from_request_parts(parts, state).await {
            Ok(CurrentUser(user)) => Ok(MaybeUser(Some(user))),
            Err(_) => Ok(MaybeUser(None)),
        }
    }
}
