//! Credential and session storage.
//!
//! # Purpose
//! Defines the storage seam used by login, registration and logout, plus the
//! record types that cross it. Two backends implement it: an in-memory store
//! for development and tests, and a Postgres store for deployments.
//!
//! # Key invariants
//! - Only active, non-deleted users can authenticate or open sessions.
//! - Every state change appends an outbox message in the same transaction.
//! - A [`LoginTransaction`] that is dropped without `commit` leaves no trace.
//! - Every write transaction is tagged with the [`AuditContext`] of the
//!   request that caused it.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(err.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Who caused a write: the request id and, once known, the acting user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditContext {
    pub request_id: Option<String>,
    pub user_id: Option<String>,
}

impl AuditContext {
    pub fn new(request_id: Option<String>, user_id: Option<String>) -> Self {
        Self {
            request_id,
            user_id,
        }
    }

    pub fn for_request(request_id: Option<&str>) -> Self {
        Self::new(request_id.map(str::to_string), None)
    }
}

/// Session row to create during login.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub username: String,
    pub user_agent: String,
    pub login_ip: String,
    pub login_location: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A persisted session joined with the owning user's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
    pub display_name: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub display_name: String,
    pub username: String,
    pub password_hash: String,
}

/// Event appended alongside a state change for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxMessage {
    pub event: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Tag of the transaction that appended the message.
    pub audit: AuditContext,
}

impl OutboxMessage {
    pub fn session_created(session: &SessionRecord) -> Self {
        Self {
            event: "SESSION_CREATED".to_string(),
            queue: "SESSION".to_string(),
            payload: json!({
                "session_id": session.session_id,
                "created_at": session.created_at,
                "expires_at": session.expires_at,
                "user_id": session.user_id,
                "name": session.display_name,
                "username": session.username,
            }),
            audit: AuditContext::default(),
        }
    }

    pub fn session_revoked(session_id: &str) -> Self {
        Self {
            event: "SESSION_REVOKED".to_string(),
            queue: "SESSION".to_string(),
            payload: json!({ "session_id": session_id }),
            audit: AuditContext::default(),
        }
    }

    pub fn with_audit(mut self, audit: &AuditContext) -> Self {
        self.audit = audit.clone();
        self
    }

    pub fn user_created(user_id: &str, user: &NewUser) -> Self {
        Self {
            event: "USER_CREATED".to_string(),
            queue: "USER".to_string(),
            payload: json!({
                "id": user_id,
                "name": user.display_name,
                "username": user.username,
                "active": true,
            }),
            audit: AuditContext::default(),
        }
    }
}

/// One serializable login transaction. Dropping it without calling
/// [`LoginTransaction::commit`] rolls back everything it did.
#[async_trait]
pub trait LoginTransaction: Send {
    /// Stored password hash of an active, non-deleted user.
    async fn get_password_hash(&mut self, username: &str) -> StoreResult<String>;
    async fn create_session(&mut self, session: NewSession) -> StoreResult<SessionRecord>;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Open a login transaction tagged with `audit`.
    async fn begin(&self, audit: &AuditContext) -> StoreResult<Box<dyn LoginTransaction>>;
    /// Register a user and return its id. A live user with the same username
    /// is a `Conflict`.
    async fn create_user(&self, user: NewUser, audit: &AuditContext) -> StoreResult<String>;
    /// Mark a session revoked. Revoking an unknown or already revoked session
    /// is not an error.
    async fn drop_session(&self, session_id: &str, audit: &AuditContext) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
