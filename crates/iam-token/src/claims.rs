use crate::errors::{TokenError, TokenResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Assertions carried by a session token.
///
/// Timestamps are whole seconds; anything finer is dropped on construction so a
/// value survives an encode/decode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionClaims {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub issued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub audience: String,
}

/// Identity half of a session, as returned by the credential store.
#[derive(Debug, Clone)]
pub struct SessionSubject {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub display_name: String,
}

impl SessionClaims {
    /// Build claims for a freshly persisted session. `issued_at` and
    /// `not_before` are both `now`.
    ///
    /// # Errors
    /// - `TokenError::InvalidClaims` when an id is empty or the session does
    ///   not expire strictly after `now`.
    pub fn for_session(
        subject: SessionSubject,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> TokenResult<Self> {
        let now = truncate_to_seconds(now);
        let claims = Self {
            session_id: subject.session_id,
            user_id: subject.user_id,
            username: subject.username,
            display_name: subject.display_name,
            issued_at: now,
            not_before: now,
            expires_at: truncate_to_seconds(expires_at),
            issuer: issuer.into(),
            audience: audience.into(),
        };
        claims.check_shape()?;
        Ok(claims)
    }

    pub(crate) fn check_shape(&self) -> TokenResult<()> {
        if self.session_id.is_empty() {
            return Err(TokenError::InvalidClaims("session id is empty".into()));
        }
        if self.user_id.is_empty() {
            return Err(TokenError::InvalidClaims("subject is empty".into()));
        }
        if self.expires_at <= self.issued_at {
            return Err(TokenError::InvalidClaims(
                "expiry must be after issue time".into(),
            ));
        }
        Ok(())
    }
}

/// JWT payload as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireClaims {
    pub iss: String,
    pub aud: Audience,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
}

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(value) => value == audience,
            Audience::Many(values) => values.iter().any(|value| value == audience),
        }
    }

    fn primary(&self) -> String {
        match self {
            Audience::One(value) => value.clone(),
            Audience::Many(values) => values.first().cloned().unwrap_or_default(),
        }
    }
}

impl From<&SessionClaims> for WireClaims {
    fn from(claims: &SessionClaims) -> Self {
        Self {
            iss: claims.issuer.clone(),
            aud: Audience::One(claims.audience.clone()),
            sub: claims.user_id.clone(),
            jti: claims.session_id.clone(),
            iat: claims.issued_at.timestamp(),
            nbf: claims.not_before.timestamp(),
            exp: claims.expires_at.timestamp(),
            username: claims.username.clone(),
            name: claims.display_name.clone(),
        }
    }
}

impl WireClaims {
    pub fn into_session_claims(self, audience: &str) -> TokenResult<SessionClaims> {
        let audience = if self.aud.contains(audience) {
            audience.to_string()
        } else {
            self.aud.primary()
        };
        Ok(SessionClaims {
            session_id: self.jti,
            user_id: self.sub,
            username: self.username,
            display_name: self.name,
            issued_at: from_epoch(self.iat, "iat")?,
            not_before: from_epoch(self.nbf, "nbf")?,
            expires_at: from_epoch(self.exp, "exp")?,
            issuer: self.iss,
            audience,
        })
    }
}

pub(crate) fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap_or(at)
}

fn from_epoch(seconds: i64, claim: &str) -> TokenResult<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| TokenError::InvalidClaims(format!("{claim} out of range")))
}
