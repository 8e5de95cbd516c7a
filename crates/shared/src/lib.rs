// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Boilerkit shared building blocks
//!
//! Database pool construction and migrations, the permission vocabulary used by
//! role-based access control, and the outbound email transport shared by the
//! API server, the billing crate and the worker.

pub mod db;
pub mod email;
pub mod permissions;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use email::{mailer_from_env, EmailError, EmailMessage, LogMailer, Mailer, MemoryMailer, ResendMailer};
pub use permissions::{Action, Grant, PermissionError, PermissionSet, Subject};
