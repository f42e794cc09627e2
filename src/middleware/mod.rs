//! Middleware components for the measurement upload server.

pub mod auth;

pub use auth::{BearerAuth, BearerAuthLayer};
