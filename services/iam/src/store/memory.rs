//! In-memory implementation of the credential store.
//!
//! # Purpose
//! Backs local development and tests without a database. All state is lost on
//! restart and nothing is shared between processes.
//!
//! # Consistency
//! A login transaction holds the store's single async mutex for its whole
//! lifetime, so transactions run one at a time and are trivially serializable.
//! Writes made inside a transaction are staged and applied on `commit`; a
//! dropped transaction discards them.
use super::{
    AuditContext, CredentialStore, LoginTransaction, NewSession, NewUser, OutboxMessage, SessionRecord,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct UserRow {
    id: String,
    display_name: String,
    username: String,
    password_hash: String,
    active: bool,
    deleted_at: Option<DateTime<Utc>>,
}

impl UserRow {
    fn is_live(&self) -> bool {
        self.active && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone)]
struct SessionRow {
    record: SessionRecord,
    user_agent: String,
    login_ip: String,
    login_location: String,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Users keyed by id.
    users: HashMap<String, UserRow>,
    sessions: HashMap<String, SessionRow>,
    outbox: Vec<OutboxMessage>,
}

impl MemoryState {
    fn live_user(&self, username: &str) -> Option<&UserRow> {
        self.users
            .values()
            .find(|user| user.username == username && user.is_live())
    }
}

/// Non-durable store shared across handlers by cloning the inner `Arc`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

/// Snapshot of a stored session, for assertions in tests.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub record: SessionRecord,
    pub user_agent: String,
    pub login_ip: String,
    pub login_location: String,
    pub revoked: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbox messages appended so far, oldest first.
    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn sessions(&self) -> Vec<StoredSession> {
        let state = self.state.lock().await;
        let mut sessions: Vec<StoredSession> = state
            .sessions
            .values()
            .map(|row| StoredSession {
                record: row.record.clone(),
                user_agent: row.user_agent.clone(),
                login_ip: row.login_ip.clone(),
                login_location: row.login_location.clone(),
                revoked: row.deleted_at.is_some(),
            })
            .collect();
        sessions.sort_by(|a, b| a.record.created_at.cmp(&b.record.created_at));
        sessions
    }

    /// Flip the active flag of a live user. Returns false when no such user.
    pub async fn set_user_active(&self, username: &str, active: bool) -> bool {
        let mut state = self.state.lock().await;
        match state
            .users
            .values_mut()
            .find(|user| user.username == username && user.deleted_at.is_none())
        {
            Some(user) => {
                user.active = active;
                true
            }
            None => false,
        }
    }

    /// Soft-delete a user. Returns false when no such user.
    pub async fn delete_user(&self, username: &str) -> bool {
        let mut state = self.state.lock().await;
        match state
            .users
            .values_mut()
            .find(|user| user.username == username && user.deleted_at.is_none())
        {
            Some(user) => {
                user.deleted_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }
}

struct MemoryLoginTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    audit: AuditContext,
    staged_sessions: Vec<SessionRow>,
    staged_outbox: Vec<OutboxMessage>,
}

#[async_trait]
impl LoginTransaction for MemoryLoginTransaction {
    async fn get_password_hash(&mut self, username: &str) -> StoreResult<String> {
        self.guard
            .live_user(username)
            .map(|user| user.password_hash.clone())
            .ok_or_else(|| StoreError::NotFound("user".into()))
    }

    async fn create_session(&mut self, session: NewSession) -> StoreResult<SessionRecord> {
        let user = self
            .guard
            .live_user(&session.username)
            .ok_or_else(|| StoreError::NotFound("user".into()))?;
        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            created_at: session.created_at,
            expires_at: session.expires_at,
            user_id: user.id.clone(),
            display_name: user.display_name.clone(),
            username: user.username.clone(),
        };
        self.staged_outbox
            .push(OutboxMessage::session_created(&record).with_audit(&self.audit));
        self.staged_sessions.push(SessionRow {
            record: record.clone(),
            user_agent: session.user_agent,
            login_ip: session.login_ip,
            login_location: session.login_location,
            deleted_at: None,
        });
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryLoginTransaction {
            mut guard,
            staged_sessions,
            staged_outbox,
            ..
        } = *self;
        for row in staged_sessions {
            guard.sessions.insert(row.record.session_id.clone(), row);
        }
        guard.outbox.extend(staged_outbox);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn begin(&self, audit: &AuditContext) -> StoreResult<Box<dyn LoginTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryLoginTransaction {
            guard,
            audit: audit.clone(),
            staged_sessions: Vec::new(),
            staged_outbox: Vec::new(),
        }))
    }

    async fn create_user(&self, user: NewUser, audit: &AuditContext) -> StoreResult<String> {
        let mut state = self.state.lock().await;
        if state
            .users
            .values()
            .any(|existing| existing.username == user.username && existing.deleted_at.is_none())
        {
            return Err(StoreError::Conflict("username taken".into()));
        }
        let id = Uuid::new_v4().to_string();
        state
            .outbox
            .push(OutboxMessage::user_created(&id, &user).with_audit(audit));
        state.users.insert(
            id.clone(),
            UserRow {
                id: id.clone(),
                display_name: user.display_name,
                username: user.username,
                password_hash: user.password_hash,
                active: true,
                deleted_at: None,
            },
        );
        Ok(id)
    }

    async fn drop_session(&self, session_id: &str, audit: &AuditContext) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let revoked = match state.sessions.get_mut(session_id) {
            Some(row) if row.deleted_at.is_none() => {
                row.deleted_at = Some(Utc::now());
                true
            }
            _ => false,
        };
        if revoked {
            state
                .outbox
                .push(OutboxMessage::session_revoked(session_id).with_audit(audit));
        }
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
