// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Boilerkit API Library
//!
//! HTTP server components: email/password authentication with revocable
//! sessions, Stripe subscription routes, file uploads and role-based access
//! control.

pub mod activity;
pub mod auth;
pub mod config;
pub mod email;
pub mod error;
pub mod rbac;
pub mod routes;
pub mod security;
pub mod state;
pub mod storage;
pub mod users;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
