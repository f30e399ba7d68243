//! Session token encoding and verification.
//!
//! # Purpose
//! Serialize [`SessionClaims`] into a compact JWS signed by one key of the
//! [`KeyRing`], and turn a presented token back into claims only when both its
//! signature and its claims check out.
//!
//! # Key invariants
//! - Signature validity and claim validity are checked independently; a token
//!   needs both.
//! - Expiry and not-before use whole seconds and no leeway: a token is valid at
//!   exactly `exp` and invalid one second later.
//! - The verification strategy is fixed at construction and never mixed within
//!   one verification.
use crate::claims::{SessionClaims, WireClaims};
use crate::errors::{TokenError, TokenResult};
use crate::keys::{KeyRing, SigningKey};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

/// How a presented token is matched to a verification key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLookup {
    /// Resolve the key named by the token header's `kid`; unknown ids fail
    /// without trying other keys.
    #[default]
    HeaderAddressed,
    /// Try every key in ring order until one verifies the signature and the
    /// decoded issuer matches. Costs one signature check per key.
    ScanAll,
}

impl FromStr for KeyLookup {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "header_addressed" | "header" | "kid" => Ok(KeyLookup::HeaderAddressed),
            "scan_all" | "scan" => Ok(KeyLookup::ScanAll),
            other => Err(format!("unknown key lookup strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenCodec {
    issuer: String,
    audience: String,
    lookup: KeyLookup,
}

impl TokenCodec {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, lookup: KeyLookup) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            lookup,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn lookup(&self) -> KeyLookup {
        self.lookup
    }

    /// Sign `claims` with `key`. The header carries the key's algorithm and id.
    pub fn encode(&self, claims: &SessionClaims, key: &SigningKey) -> TokenResult<String> {
        let mut header = Header::new(key.algorithm());
        header.typ = Some("JWT".to_string());
        header.kid = Some(key.id().to_string());
        let wire = WireClaims::from(claims);
        jsonwebtoken::encode(&header, &wire, key.encoding_key())
            .map_err(|err| TokenError::Signing(format!("key {}: {err}", key.id())))
    }

    /// Verify `token` against `ring` at the current time.
    pub fn decode(&self, token: &str, ring: &KeyRing) -> TokenResult<SessionClaims> {
        self.decode_at(token, ring, Utc::now())
    }

    /// Verify `token` against `ring` as of `now`.
    pub fn decode_at(
        &self,
        token: &str,
        ring: &KeyRing,
        now: DateTime<Utc>,
    ) -> TokenResult<SessionClaims> {
        let wire = match self.lookup {
            KeyLookup::HeaderAddressed => self.verify_with_header_key(token, ring)?,
            KeyLookup::ScanAll => self.verify_with_any_key(token, ring)?,
        };
        self.check_claims(wire, now.timestamp())
    }

    fn verify_with_header_key(&self, token: &str, ring: &KeyRing) -> TokenResult<WireClaims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|err| TokenError::InvalidToken(format!("unreadable header: {err}")))?;
        let kid = header
            .kid
            .ok_or_else(|| TokenError::InvalidToken("header has no key id".into()))?;
        let key = ring.resolve_key(&kid).ok_or_else(|| {
            tracing::debug!(kid = %kid, "token names an unknown signing key");
            TokenError::UnknownKey(kid.clone())
        })?;
        verify_signature(token, key)
    }

    fn verify_with_any_key(&self, token: &str, ring: &KeyRing) -> TokenResult<WireClaims> {
        for key in ring.all_keys() {
            match verify_signature(token, key) {
                Ok(wire) if wire.iss == self.issuer => return Ok(wire),
                Ok(_) => {
                    tracing::debug!(kid = key.id(), "signature verified but issuer differs");
                }
                Err(_) => {}
            }
        }
        Err(TokenError::InvalidToken(
            "no configured key verifies the token".into(),
        ))
    }

    fn check_claims(&self, wire: WireClaims, now: i64) -> TokenResult<SessionClaims> {
        if wire.iss != self.issuer {
            return Err(TokenError::InvalidClaims(format!(
                "unexpected issuer {}",
                wire.iss
            )));
        }
        if !wire.aud.contains(&self.audience) {
            return Err(TokenError::InvalidClaims("audience mismatch".into()));
        }
        if wire.sub.is_empty() {
            return Err(TokenError::InvalidClaims("subject is empty".into()));
        }
        if wire.jti.is_empty() {
            return Err(TokenError::InvalidClaims("session id is empty".into()));
        }
        if now < wire.nbf {
            return Err(TokenError::InvalidClaims("token not yet valid".into()));
        }
        if now > wire.exp {
            return Err(TokenError::InvalidClaims("token expired".into()));
        }
        wire.into_session_claims(&self.audience)
    }
}

fn verify_signature(token: &str, key: &SigningKey) -> TokenResult<WireClaims> {
    let mut validation = Validation::new(key.algorithm());
    // Claims are checked by the codec with its own clock.
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    jsonwebtoken::decode::<WireClaims>(token, key.decoding_key(), &validation)
        .map(|data| data.claims)
        .map_err(|err| TokenError::InvalidToken(format!("key {}: {err}", key.id())))
}
