//! User registration.
//!
//! Only a signed-in user can register another one; the registering user is
//! recorded on the write.
use crate::api::auth::request_id;
use crate::api::error::{ApiError, api_conflict, api_internal, api_internal_message, api_validation_error};
use crate::api::types::{RegisterUserRequest, RegisterUserResponse};
use crate::app::AppState;
use crate::auth::password::hash_password;
use crate::auth::verifier::AuthenticatedSession;
use crate::store::{AuditContext, NewUser, StoreError};
use axum::Json;
use axum::extract::{Extension, State};
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use std::ops::RangeInclusive;

const NAME_LEN: RangeInclusive<usize> = 5..=99;
const USERNAME_LEN: RangeInclusive<usize> = 5..=63;
const PASSWORD_LEN: RangeInclusive<usize> = 8..=127;

fn check_len(field: &str, value: &str, range: RangeInclusive<usize>) -> Result<(), String> {
    let len = value.chars().count();
    if range.contains(&len) {
        Ok(())
    } else {
        Err(format!(
            "{field} must be between {} and {} characters",
            range.start(),
            range.end()
        ))
    }
}

pub(crate) fn validate(request: &RegisterUserRequest) -> Result<(), String> {
    check_len("name", request.name.trim(), NAME_LEN)?;
    check_len("username", &request.username, USERNAME_LEN)?;
    if request.username.chars().any(char::is_whitespace) {
        return Err("username must not contain whitespace".to_string());
    }
    check_len("password", &request.password, PASSWORD_LEN)
}

#[utoipa::path(
    post,
    path = "/v1/user",
    tag = "users",
    request_body = RegisterUserRequest,
    responses(
        (status = 201, description = "User created", body = RegisterUserResponse),
        (status = 400, description = "Validation failed", body = crate::api::types::ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = crate::api::types::ErrorResponse),
        (status = 409, description = "Username taken", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn register_user(
    State(state): State<AppState>,
    Extension(session): Extension<AuthenticatedSession>,
    headers: HeaderMap,
    payload: Result<Json<RegisterUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterUserResponse>), ApiError> {
    let request_id = request_id(&headers);
    let Json(body) = payload.map_err(|err| ApiError::from(err).with_request_id(request_id.clone()))?;
    validate(&body).map_err(|message| api_validation_error(&message).with_request_id(request_id.clone()))?;

    let password_hash = hash_password(body.password, state.password_cost)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "password hashing failed");
            api_internal_message("registration failed").with_request_id(request_id.clone())
        })?;
    let user = NewUser {
        display_name: body.name.trim().to_string(),
        username: body.username,
        password_hash,
    };
    let audit = AuditContext::new(request_id.clone(), Some(session.user_id));
    match state.store.create_user(user, &audit).await {
        Ok(id) => {
            metrics::counter!("iam_users_created_total").increment(1);
            tracing::info!(new_user_id = %id, "user registered");
            Ok((StatusCode::CREATED, Json(RegisterUserResponse { id })))
        }
        Err(StoreError::Conflict(_)) => {
            Err(api_conflict("username_taken", "username already exists").with_request_id(request_id))
        }
        Err(err) => Err(api_internal("registration failed", &err).with_request_id(request_id)),
    }
}
