//! HTTP handlers for the ingress and connections endpoints (SPEC_FULL §6).

pub mod connections;
pub mod error;
pub mod health;
pub mod messages;

pub use error::{ApiError, ApiResult};
