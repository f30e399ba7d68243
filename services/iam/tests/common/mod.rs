#![allow(dead_code)]

use axum::body::Body;
use axum::http::Request;
use iam::app::AppState;
use iam::auth::issuer::SessionIssuer;
use iam::auth::password::{MIN_COST, hash_password};
use iam::auth::verifier::SessionVerifier;
use iam::store::memory::InMemoryStore;
use iam::store::{AuditContext, CredentialStore, NewUser};
use iam_token::testutil::{ed25519_material, hmac_material, rsa_material};
use iam_token::{Jwks, KeyLookup, KeyRing, TokenCodec};
use std::sync::Arc;
use std::time::Duration;

pub const ISSUER: &str = "iam.test";
pub const AUDIENCE: &str = "iam-clients";
pub const ALICE_PASSWORD: &str = "correct-password";

pub struct TestApp {
    pub state: AppState,
    pub store: InMemoryStore,
    pub codec: Arc<TokenCodec>,
}

/// Memory-backed state with one RSA, one Ed25519 and one HMAC key, and a
/// registered user `alice`.
pub async fn test_app() -> TestApp {
    let ring = Arc::new(
        KeyRing::from_material(vec![
            rsa_material("rsa-1"),
            ed25519_material("ed-1", 9),
            hmac_material("hs-1", &[5u8; 32]),
        ])
        .expect("ring"),
    );
    let codec = Arc::new(TokenCodec::new(ISSUER, AUDIENCE, KeyLookup::HeaderAddressed));
    let store = InMemoryStore::new();
    store
        .create_user(
            NewUser {
                display_name: "Alice Liddell".to_string(),
                username: "alice".to_string(),
                password_hash: hash_password(ALICE_PASSWORD.to_string(), MIN_COST)
                    .await
                    .expect("hash"),
            },
            &AuditContext::default(),
        )
        .await
        .expect("alice");

    let shared: Arc<dyn CredentialStore + Send + Sync> = Arc::new(store.clone());
    let issuer = SessionIssuer::new(
        shared.clone(),
        ring.clone(),
        codec.clone(),
        Duration::from_secs(3600),
        MIN_COST,
    )
    .await
    .expect("issuer");
    let state = AppState {
        store: shared,
        issuer,
        verifier: SessionVerifier::new(ring.clone(), codec.clone()),
        jwks: Arc::new(Jwks::from_ring(&ring)),
        ring,
        password_cost: MIN_COST,
    };
    TestApp {
        state,
        store,
        codec,
    }
}

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn bearer_request(method: &str, uri: &str, authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(value) = authorization {
        builder = builder.header("authorization", value);
    }
    builder.body(Body::empty()).expect("request")
}

pub fn authorized_json_request(
    method: &str,
    uri: &str,
    token: &str,
    body: serde_json::Value,
) -> Request<Body> {
    let mut request = json_request(method, uri, body);
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().expect("header"),
    );
    request
}
