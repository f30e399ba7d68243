//! Login: credential check, session persistence and token issuance.
//!
//! # Flow
//! `begin → get_password_hash → verify → create_session → build claims →
//! select key + encode → commit`. Any failure drops the transaction, which
//! rolls it back, so a token is only ever returned for a committed session.
//!
//! # Security
//! - Unknown users, inactive users and wrong passwords produce the same
//!   error, and unknown users still pay for one bcrypt verification.
//! - Passwords and tokens are never logged.
use crate::auth::password::{hash_password, verify_password};
use crate::config::MAX_SESSION_TTL_SECS;
use crate::store::{AuditContext, CredentialStore, NewSession, StoreError};
use anyhow::{Context, bail};
use chrono::{DateTime, SubsecRound, Utc};
use iam_token::{KeyRing, SessionClaims, SessionSubject, TokenCodec, TokenError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use utoipa::ToSchema;

pub const INVALID_CREDENTIALS: &str = "invalid username or password";
pub const TOKEN_KIND: &str = "Bearer";

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("invalid username or password")]
    Authentication,
    #[error("session persistence failed: {0}")]
    Persistence(#[source] StoreError),
    #[error("token signing failed: {0}")]
    Signing(#[source] TokenError),
}

impl LoginError {
    fn outcome(&self) -> &'static str {
        match self {
            LoginError::Authentication => "rejected",
            LoginError::Persistence(_) => "persistence_error",
            LoginError::Signing(_) => "signing_error",
        }
    }
}

/// Credentials and client context for one login.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub client_ip: String,
    pub client_location: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IssuedToken {
    pub token: String,
    pub kind: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionIssuer {
    store: Arc<dyn CredentialStore + Send + Sync>,
    ring: Arc<KeyRing>,
    codec: Arc<TokenCodec>,
    session_ttl: chrono::Duration,
    // Verified against when the user does not exist.
    decoy_hash: Arc<str>,
}

impl SessionIssuer {
    /// Fails for a TTL outside `1..=MAX_SESSION_TTL_SECS` seconds or a cost
    /// bcrypt rejects.
    pub async fn new(
        store: Arc<dyn CredentialStore + Send + Sync>,
        ring: Arc<KeyRing>,
        codec: Arc<TokenCodec>,
        session_ttl: std::time::Duration,
        password_cost: u32,
    ) -> anyhow::Result<Self> {
        if session_ttl.as_secs() == 0 || session_ttl.as_secs() > MAX_SESSION_TTL_SECS {
            bail!("session ttl must be between 1 and {MAX_SESSION_TTL_SECS} seconds");
        }
        let session_ttl =
            chrono::Duration::from_std(session_ttl).context("session ttl out of range")?;
        let decoy_hash = hash_password(uuid::Uuid::new_v4().to_string(), password_cost)
            .await
            .context("hash decoy password")?;
        Ok(Self {
            store,
            ring,
            codec,
            session_ttl,
            decoy_hash: Arc::from(decoy_hash),
        })
    }

    pub async fn login(
        &self,
        attempt: LoginAttempt,
        request_id: Option<&str>,
    ) -> Result<IssuedToken, LoginError> {
        let result = self.run_login(attempt, request_id).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.outcome(),
        };
        metrics::counter!("iam_logins_total", "outcome" => outcome).increment(1);
        result
    }

    async fn run_login(
        &self,
        attempt: LoginAttempt,
        request_id: Option<&str>,
    ) -> Result<IssuedToken, LoginError> {
        let mut tx = self
            .store
            .begin(&AuditContext::for_request(request_id))
            .await
            .map_err(LoginError::Persistence)?;

        let stored_hash = match tx.get_password_hash(&attempt.username).await {
            Ok(hash) => Some(hash),
            Err(StoreError::NotFound(_)) => None,
            Err(err) => return Err(LoginError::Persistence(err)),
        };
        let known_user = stored_hash.is_some();
        let hash = stored_hash.unwrap_or_else(|| self.decoy_hash.to_string());
        let password_ok = verify_password(attempt.password, hash).await;
        if !(known_user && password_ok) {
            tracing::debug!("login rejected");
            return Err(LoginError::Authentication);
        }

        let now = Utc::now().trunc_subsecs(0);
        let expires_at = session_expiry(now, self.session_ttl)?;
        let record = tx
            .create_session(NewSession {
                username: attempt.username,
                user_agent: attempt.user_agent,
                login_ip: attempt.client_ip,
                login_location: attempt.client_location,
                created_at: now,
                expires_at,
            })
            .await
            .map_err(LoginError::Persistence)?;

        let claims = SessionClaims::for_session(
            SessionSubject {
                session_id: record.session_id.clone(),
                user_id: record.user_id.clone(),
                username: record.username.clone(),
                display_name: record.display_name.clone(),
            },
            self.codec.issuer(),
            self.codec.audience(),
            now,
            record.expires_at,
        )
        .map_err(LoginError::Signing)?;
        let key = self
            .ring
            .select_signing_key()
            .map_err(LoginError::Signing)?;
        let token = self
            .codec
            .encode(&claims, key)
            .map_err(LoginError::Signing)?;

        tx.commit().await.map_err(LoginError::Persistence)?;
        tracing::info!(
            session_id = %record.session_id,
            user_id = %record.user_id,
            kid = key.id(),
            "session issued"
        );
        Ok(IssuedToken {
            token,
            kind: TOKEN_KIND.to_string(),
            expires_at: claims.expires_at,
        })
    }
}

fn session_expiry(
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<DateTime<Utc>, LoginError> {
    now.checked_add_signed(ttl).ok_or_else(|| {
        LoginError::Signing(TokenError::InvalidClaims(
            "session expiry out of range".into(),
        ))
    })
}
