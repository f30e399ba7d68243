//! OpenAPI document for the IAM HTTP API.
use crate::api::{
    auth, system,
    types::{
        ErrorResponse, HealthStatus, LoginRequest, LoginResponse, RegisterUserRequest,
        RegisterUserResponse,
    },
    users,
};
use crate::auth::jwks;
use iam_token::{Jwk, Jwks, KeyUse, SessionClaims};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "iam",
        version = "v1",
        description = "Identity and session-token HTTP API"
    ),
    paths(
        system::system_health,
        auth::login,
        auth::current_session,
        auth::logout,
        users::register_user,
        jwks::published_keys
    ),
    components(schemas(
        HealthStatus,
        ErrorResponse,
        LoginRequest,
        LoginResponse,
        RegisterUserRequest,
        RegisterUserResponse,
        SessionClaims,
        Jwk,
        Jwks,
        KeyUse
    )),
    tags(
        (name = "system", description = "Health and discovery"),
        (name = "auth", description = "Login, sessions and signing keys"),
        (name = "users", description = "User registration")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        for expected in [
            "/v1/system/health",
            "/v1/auth/login",
            "/v1/auth/session",
            "/v1/user",
            "/.well-known/jwks.json",
        ] {
            assert!(paths.iter().any(|path| path.as_str() == expected), "{expected}");
        }
    }
}
