//! portcullis HTTP gateway.
//!
//! This crate wires the `portcullis_access` authentication and permission
//! core into an Axum server: the `/auth/*` login flow, the session cookie,
//! a per-route permission guard, and administrative endpoints.

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod sweep;
