//! IAM service library crate.
//!
//! # Purpose
//! Exposes the HTTP API, authentication flow, configuration and credential
//! store backends for use by the binary and integration tests.
pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod observability;
pub mod store;
