use thiserror::Error;

/// Failures raised by the key ring and the token codec.
///
/// The verification-path variants (`UnknownKey`, `InvalidToken`,
/// `InvalidClaims`) carry detail for server-side logs only. Callers at the
/// HTTP boundary collapse all of them into a single generic 401.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("key ring configuration error: {0}")]
    Configuration(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("unknown signing key id: {0}")]
    UnknownKey(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
}

pub type TokenResult<T> = Result<T, TokenError>;

impl TokenError {
    /// True for every failure that can only happen while verifying a token.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            TokenError::UnknownKey(_) | TokenError::InvalidToken(_) | TokenError::InvalidClaims(_)
        )
    }
}
