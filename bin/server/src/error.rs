//! Error responses for the HTTP edge.
//!
//! Domain errors from `portcullis_access` carry detail for logs. What the
//! client sees is deliberately coarse: every login failure gets the same
//! body, and a 403 never names the missing permission.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::auth::LOGIN_URL;

/// Generic message for any failed login.
pub const LOGIN_FAILED_MESSAGE: &str = "authentication failed, please try again";

/// Errors returned by handlers and the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No valid session on an API request.
    Unauthenticated,
    /// Authenticated, but the role lacks a permission.
    Forbidden,
    /// The login flow failed at any step.
    LoginFailed,
    /// A named resource does not exist.
    NotFound { what: String },
    /// The request body or parameters are unusable.
    BadRequest { reason: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "authentication required"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::LoginFailed => write!(f, "{LOGIN_FAILED_MESSAGE}"),
            Self::NotFound { what } => write!(f, "{what} not found"),
            Self::BadRequest { reason } => write!(f, "bad request: {reason}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "authentication required", "login_url": LOGIN_URL })),
            )
                .into_response(),
            Self::Forbidden => {
                (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" }))).into_response()
            }
            Self::LoginFailed => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": LOGIN_FAILED_MESSAGE })),
            )
                .into_response(),
            Self::NotFound { .. } => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            Self::BadRequest { reason } => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
            }
        }
    }
}
