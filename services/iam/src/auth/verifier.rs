//! Bearer-token verification for protected routes.
//!
//! # Key invariants
//! - A request without a well-formed `Authorization: Bearer <token>` header is
//!   never treated as anonymous; it is rejected.
//! - Every failure reaches the client as the same 401. The precise reason is
//!   logged at debug level and counted by outcome.
use crate::api::error::{ApiError, api_unauthorized};
use crate::app::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use iam_token::{KeyRing, SessionClaims, TokenCodec, TokenError};
use std::sync::Arc;
use thiserror::Error;

/// Shortest header that can hold the scheme plus a token.
pub const MIN_AUTHORIZATION_LEN: usize = 10;
pub const BEARER_PREFIX: &str = "Bearer ";
pub const INVALID_SESSION: &str = "invalid session";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed authorization header")]
    Malformed,
    #[error(transparent)]
    Token(#[from] TokenError),
}

impl VerifyError {
    fn outcome(&self) -> &'static str {
        match self {
            VerifyError::Malformed => "malformed",
            VerifyError::Token(err) if !err.is_verification_failure() => "internal_error",
            VerifyError::Token(TokenError::UnknownKey(_)) => "unknown_key",
            VerifyError::Token(TokenError::InvalidClaims(_)) => "invalid_claims",
            VerifyError::Token(_) => "invalid_token",
        }
    }
}

/// Verified session attached to a request's extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub session_id: String,
    pub user_id: String,
    pub claims: SessionClaims,
}

impl From<SessionClaims> for AuthenticatedSession {
    fn from(claims: SessionClaims) -> Self {
        Self {
            session_id: claims.session_id.clone(),
            user_id: claims.user_id.clone(),
            claims,
        }
    }
}

#[derive(Clone)]
pub struct SessionVerifier {
    ring: Arc<KeyRing>,
    codec: Arc<TokenCodec>,
}

impl SessionVerifier {
    pub fn new(ring: Arc<KeyRing>, codec: Arc<TokenCodec>) -> Self {
        Self { ring, codec }
    }

    /// Verify the raw `Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<SessionClaims, VerifyError> {
        self.authenticate_at(header, Utc::now())
    }

    pub fn authenticate_at(
        &self,
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionClaims, VerifyError> {
        let result = bearer_token(header).and_then(|token| {
            self.codec
                .decode_at(token, &self.ring, now)
                .map_err(VerifyError::from)
        });
        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.outcome(),
        };
        metrics::counter!("iam_token_verifications_total", "outcome" => outcome).increment(1);
        result
    }
}

fn bearer_token(header: Option<&str>) -> Result<&str, VerifyError> {
    let header = header.ok_or(VerifyError::Malformed)?;
    if header.len() < MIN_AUTHORIZATION_LEN {
        return Err(VerifyError::Malformed);
    }
    header
        .strip_prefix(BEARER_PREFIX)
        .ok_or(VerifyError::Malformed)
}

/// Middleware for routes that need a signed-in user.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let claims = match state.verifier.authenticate(header) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::debug!(error = %err, "session verification failed");
            return Err(api_unauthorized(INVALID_SESSION));
        }
    };
    let session = AuthenticatedSession::from(claims);
    tracing::Span::current().record("user_id", session.user_id.as_str());
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use iam_token::testutil::{ed25519_material, rsa_material};
    use iam_token::{KeyLookup, SessionSubject};

    fn verifier() -> (SessionVerifier, Arc<KeyRing>, Arc<TokenCodec>) {
        let ring = Arc::new(
            KeyRing::from_material(vec![rsa_material("rsa-1"), ed25519_material("ed-1", 4)])
                .expect("ring"),
        );
        let codec = Arc::new(TokenCodec::new("iam", "clients", KeyLookup::HeaderAddressed));
        (SessionVerifier::new(ring.clone(), codec.clone()), ring, codec)
    }

    fn token(ring: &KeyRing, codec: &TokenCodec, issued: DateTime<Utc>) -> String {
        let claims = SessionClaims::for_session(
            SessionSubject {
                session_id: "s-1".to_string(),
                user_id: "u-1".to_string(),
                username: "alice".to_string(),
                display_name: "Alice".to_string(),
            },
            "iam",
            "clients",
            issued,
            issued + Duration::minutes(10),
        )
        .expect("claims");
        codec
            .encode(&claims, ring.select_signing_key().expect("key"))
            .expect("encode")
    }

    #[test]
    fn header_shape_is_checked_before_decoding() {
        let (verifier, _, _) = verifier();
        for header in [None, Some(""), Some("Bearer"), Some("Bearer x"), Some("Basic dXNlcjpwdw==")] {
            let err = verifier.authenticate(header).expect_err("malformed");
            assert!(matches!(err, VerifyError::Malformed), "{header:?}");
        }
        let err = verifier
            .authenticate(Some("Bearer not.a.token"))
            .expect_err("garbage");
        assert!(matches!(err, VerifyError::Token(TokenError::InvalidToken(_))));
    }

    #[test]
    fn valid_bearer_token_yields_claims() {
        let (verifier, ring, codec) = verifier();
        let issued = Utc::now();
        let token = token(&ring, &codec, issued);
        let claims = verifier
            .authenticate(Some(&format!("Bearer {token}")))
            .expect("claims");
        assert_eq!(claims.user_id, "u-1");
        assert_eq!(claims.session_id, "s-1");
        let session = AuthenticatedSession::from(claims);
        assert_eq!(session.user_id, "u-1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let (verifier, ring, codec) = verifier();
        let issued = Utc.timestamp_opt(1_800_000_000, 0).single().expect("time");
        let token = token(&ring, &codec, issued);
        let header = format!("Bearer {token}");
        assert!(
            verifier
                .authenticate_at(Some(&header), issued + Duration::minutes(10))
                .is_ok()
        );
        let err = verifier
            .authenticate_at(Some(&header), issued + Duration::minutes(10) + Duration::seconds(1))
            .expect_err("expired");
        assert!(matches!(err, VerifyError::Token(TokenError::InvalidClaims(_))));
    }

    #[test]
    fn outcomes_separate_rejections_from_faults() {
        let cases = [
            (VerifyError::Malformed, "malformed"),
            (TokenError::UnknownKey("k9".into()).into(), "unknown_key"),
            (TokenError::InvalidClaims("expired".into()).into(), "invalid_claims"),
            (TokenError::InvalidToken("bad signature".into()).into(), "invalid_token"),
            (TokenError::Signing("broken key".into()).into(), "internal_error"),
            (TokenError::Configuration("no keys".into()).into(), "internal_error"),
        ];
        for (err, outcome) in cases {
            assert_eq!(err.outcome(), outcome, "{err}");
        }
    }

    #[test]
    fn prefix_is_case_sensitive() {
        let (verifier, ring, codec) = verifier();
        let token = token(&ring, &codec, Utc::now());
        let err = verifier
            .authenticate(Some(&format!("bearer {token}")))
            .expect_err("lowercase scheme");
        assert!(matches!(err, VerifyError::Malformed));
    }
}
