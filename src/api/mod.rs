// HTTP API Server module

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod management;
pub mod streaming;

use crate::error::ProxyError;
use crate::proxy::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Keys clients must present; empty means the proxy is open.
    pub api_keys: Arc<Vec<String>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, api_keys: Vec<String>) -> Self {
        Self {
            orchestrator,
            api_keys: Arc::new(api_keys),
            started_at: Utc::now(),
        }
    }
}

/// API Key authentication middleware
async fn auth_middleware(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    // If no API keys configured, allow all requests
    if state.api_keys.is_empty() {
        return next.run(request).await;
    }

    // Support `x-api-key`, "Bearer <key>" and a raw key
    let presented = request
        .headers()
        .get("x-api-key")
        .or_else(|| request.headers().get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).trim().to_string());

    match presented {
        Some(key) if state.api_keys.contains(&key) => next.run(request).await,
        _ => {
            tracing::warn!("Rejected {} {}: invalid API key", request.method(), request.uri().path());
            ProxyError::Auth.into_response()
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    // Routes that require API key authentication
    let protected_routes = Router::new()
        .route("/v1/messages", post(handlers::proxy))
        .route("/v1/messages/count_tokens", post(handlers::count_tokens))
        .route("/v1/chat/completions", post(handlers::proxy))
        .route("/chat/completions", post(handlers::proxy))
        .route("/v1/responses", post(handlers::proxy))
        .route("/responses", post(handlers::proxy))
        // Management API
        .route(
            "/management/endpoints",
            get(management::list_endpoints).post(management::add_endpoint),
        )
        .route("/management/endpoints/:name", delete(management::delete_endpoint))
        .route("/management/endpoints/:name/recover", post(management::recover_endpoint))
        .route("/management/endpoints/:name/enabled", put(management::set_endpoint_enabled))
        // Anything else is classified by its body
        .fallback(handlers::proxy)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Routes that don't require authentication
    let public_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<F>(state: AppState, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}
