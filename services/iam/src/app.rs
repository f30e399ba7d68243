//! HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers.
//!
//! # Notes
//! Layers run outermost-last: the request id is assigned first, then the
//! trace span is opened with it, then the id is echoed on the response.
//! Each response is logged once at INFO inside the request span, which carries
//! the method, path, request id, client IP, user agent and, after
//! authentication, the user id.
use crate::api;
use crate::api::auth::{REQUEST_ID_HEADER, client_ip};
use crate::api::openapi::ApiDoc;
use crate::auth;
use crate::auth::issuer::SessionIssuer;
use crate::auth::verifier::SessionVerifier;
use crate::config::{IamConfig, StorageBackend};
use crate::observability;
use crate::store::{CredentialStore, memory::InMemoryStore, postgres::PostgresStore};
use anyhow::Context;
use axum::Router;
use axum::extract::ConnectInfo;
use axum::http::header::USER_AGENT;
use axum::routing::{get, post};
use iam_token::{Jwks, KeyRing, TokenCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CredentialStore + Send + Sync>,
    pub issuer: SessionIssuer,
    pub verifier: SessionVerifier,
    pub ring: Arc<KeyRing>,
    /// Computed once from `ring`.
    pub jwks: Arc<Jwks>,
    pub password_cost: u32,
}

/// Wire the store, key ring and auth components from configuration.
///
/// Fails when no key is configured, when any key fails to load, or when the
/// selected store is unreachable.
pub async fn build_state(config: &IamConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn CredentialStore + Send + Sync> = match config.storage {
        StorageBackend::Memory => Arc::new(InMemoryStore::new()),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(PostgresStore::connect(pg).await?)
        }
    };

    let material = config.load_key_material()?;
    let ring = Arc::new(KeyRing::from_material(material).context("build signing key ring")?);
    let codec = Arc::new(TokenCodec::new(
        config.issuer.clone(),
        config.audience.clone(),
        config.key_lookup,
    ));
    let issuer = SessionIssuer::new(
        store.clone(),
        ring.clone(),
        codec.clone(),
        config.session_ttl,
        config.password_cost,
    )
    .await?;
    tracing::info!(
        keys = ring.len(),
        lookup = ?config.key_lookup,
        storage = store.backend_name(),
        durable = store.is_durable(),
        "iam state ready"
    );

    Ok(AppState {
        verifier: SessionVerifier::new(ring.clone(), codec),
        jwks: Arc::new(Jwks::from_ring(&ring)),
        issuer,
        store,
        ring,
        password_cost: config.password_cost,
    })
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &axum::http::Request<_>| {
            let headers = request.headers();
            let parent = observability::trace_context_from_headers(headers);
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
            };
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %header(REQUEST_ID_HEADER),
                client_ip = %client_ip(headers, peer),
                user_agent = %header(USER_AGENT.as_str()),
                user_id = tracing::field::Empty
            );
            span.set_parent(parent);
            span
        })
        .on_response(
            |response: &axum::http::Response<_>, latency: Duration, _span: &Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "request completed"
                );
            },
        );

    let protected = Router::new()
        .route(
            "/v1/auth/session",
            get(api::auth::current_session).delete(api::auth::logout),
        )
        .route(
            "/session",
            get(api::auth::current_session).delete(api::auth::logout),
        )
        .route("/v1/user", post(api::users::register_user))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::verifier::require_session,
        ));

    Router::new()
        .route("/v1/system/health", get(api::system::system_health))
        .route("/v1/auth/login", post(api::auth::login))
        .route("/keys", get(auth::jwks::published_keys))
        .route("/.well-known/jwks.json", get(auth::jwks::published_keys))
        .merge(protected)
        .merge(
            utoipa_swagger_ui::SwaggerUi::new("/docs").url("/v1/openapi.json", ApiDoc::openapi()),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace_layer)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
