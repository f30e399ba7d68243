//! Login, session introspection and logout handlers.
//!
//! # Security considerations
//! - Every credential failure is the same 401 body.
//! - Request bodies are never logged; they carry passwords.
use crate::api::error::{
    ApiError, api_internal, api_internal_message, api_unauthorized, api_validation_error,
};
use crate::api::types::{LoginRequest, LoginResponse};
use crate::app::AppState;
use crate::auth::issuer::{INVALID_CREDENTIALS, LoginAttempt, LoginError};
use crate::auth::verifier::AuthenticatedSession;
use crate::store::AuditContext;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Extension, State};
use axum::http::{HeaderMap, StatusCode, header::USER_AGENT};
use iam_token::SessionClaims;
use std::net::SocketAddr;

pub const UNKNOWN_IP: &str = "0.0.0.0";
pub const UNKNOWN_LOCATION: &str = "unknown";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

pub(crate) fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// First `X-Forwarded-For` hop, then the peer address, then `0.0.0.0`.
/// Values that do not parse as an IP are ignored.
pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .and_then(|hop| hop.parse::<std::net::IpAddr>().ok());
    forwarded
        .or(peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 201, description = "Session created", body = LoginResponse),
        (status = 400, description = "Malformed body", body = crate::api::types::ErrorResponse),
        (status = 401, description = "Invalid credentials", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn login(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LoginResponse>), ApiError> {
    let request_id = request_id(&headers);
    let Json(body) = payload.map_err(|err| ApiError::from(err).with_request_id(request_id.clone()))?;
    if body.username.is_empty() || body.password.is_empty() {
        return Err(
            api_validation_error("username and password are required")
                .with_request_id(request_id),
        );
    }

    let attempt = LoginAttempt {
        username: body.username,
        password: body.password,
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        client_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
        client_location: UNKNOWN_LOCATION.to_string(),
    };

    match state.issuer.login(attempt, request_id.as_deref()).await {
        Ok(issued) => Ok((
            StatusCode::CREATED,
            Json(LoginResponse {
                token: issued.token,
                kind: issued.kind,
                expires_at: issued.expires_at,
            }),
        )),
        Err(LoginError::Authentication) => {
            Err(api_unauthorized(INVALID_CREDENTIALS).with_request_id(request_id))
        }
        Err(LoginError::Persistence(err)) => {
            Err(api_internal("login failed", &err).with_request_id(request_id))
        }
        Err(LoginError::Signing(err)) => {
            tracing::error!(error = ?err, "token signing failed");
            Err(api_internal_message("login failed").with_request_id(request_id))
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    tag = "auth",
    responses(
        (status = 200, description = "Claims of the presented token", body = SessionClaims),
        (status = 401, description = "Missing or invalid token", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn current_session(
    Extension(session): Extension<AuthenticatedSession>,
) -> Json<SessionClaims> {
    Json(session.claims)
}

#[utoipa::path(
    delete,
    path = "/v1/auth/session",
    tag = "auth",
    responses(
        (status = 204, description = "Session revoked"),
        (status = 401, description = "Missing or invalid token", body = crate::api::types::ErrorResponse)
    )
)]
/// Record the logout. Tokens stay valid until they expire.
pub(crate) async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<AuthenticatedSession>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let request_id = request_id(&headers);
    let audit = AuditContext::new(request_id.clone(), Some(session.user_id.clone()));
    state
        .store
        .drop_session(&session.session_id, &audit)
        .await
        .map_err(|err| api_internal("logout failed", &err).with_request_id(request_id))?;
    tracing::info!(session_id = %session.session_id, "session revoked");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "192.0.2.1:5000".parse().expect("addr");
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_to_peer_then_unknown() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.1:5000".parse().expect("addr");
        assert_eq!(client_ip(&headers, Some(peer)), "192.0.2.1");
        assert_eq!(client_ip(&headers, None), UNKNOWN_IP);

        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, None), UNKNOWN_IP);
    }

    #[test]
    fn request_id_is_read_from_header() {
        let mut headers = HeaderMap::new();
        assert!(request_id(&headers).is_none());
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(request_id(&headers).as_deref(), Some("abc"));
    }
}
