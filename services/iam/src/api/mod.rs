//! IAM HTTP API handlers and payload types.
pub mod auth;
pub mod error;
pub mod openapi;
pub mod system;
pub mod types;
pub mod users;
