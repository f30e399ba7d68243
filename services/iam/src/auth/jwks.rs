//! Published key set handler.
//!
//! The key set is built once from the ring at startup. Symmetric keys never
//! appear in it, and private material cannot: `Jwk` has no field for it.
use crate::app::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::header::CACHE_CONTROL;
use axum::response::IntoResponse;

const CACHE_POLICY: &str = "public, max-age=300";

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = "auth",
    responses((status = 200, description = "Public signing keys", body = iam_token::Jwks))
)]
pub async fn published_keys(State(state): State<AppState>) -> impl IntoResponse {
    ([(CACHE_CONTROL, CACHE_POLICY)], Json(state.jwks.as_ref().clone()))
}
