// Management API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::config::EndpointConfig;
use crate::error::{error_body, RegistryError};

fn registry_error(err: RegistryError) -> Response {
    let (status, code) = match err {
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "endpoint_not_found"),
        RegistryError::Duplicate(_) => (StatusCode::CONFLICT, "endpoint_exists"),
        RegistryError::NoUrl(_) => (StatusCode::BAD_REQUEST, "invalid_endpoint"),
    };
    (status, Json(error_body(code, &err.to_string()))).into_response()
}

/// List all endpoints with health and learned state
pub async fn list_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    let endpoints: Vec<_> = state
        .orchestrator
        .registry()
        .snapshot()
        .iter()
        .map(|e| e.view())
        .collect();
    Json(json!({ "endpoints": endpoints }))
}

/// Blacklisted -> recovering, without waiting for the recovery period
pub async fn recover_endpoint(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.registry().get(&name) {
        Some(endpoint) => {
            endpoint.manual_recover();
            tracing::info!("Endpoint {} manually recovered", name);
            Json(json!({ "success": true, "endpoint": endpoint.view() })).into_response()
        }
        None => registry_error(RegistryError::NotFound(name)),
    }
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

pub async fn set_endpoint_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<EnabledRequest>,
) -> Response {
    match state.orchestrator.registry().get(&name) {
        Some(endpoint) => {
            endpoint.set_enabled(payload.enabled);
            tracing::info!("Endpoint {} enabled={}", name, payload.enabled);
            Json(json!({ "success": true, "endpoint": endpoint.view() })).into_response()
        }
        None => registry_error(RegistryError::NotFound(name)),
    }
}

pub async fn delete_endpoint(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.registry().remove(&name) {
        Ok(()) => {
            tracing::info!("Endpoint {} removed", name);
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => registry_error(e),
    }
}

pub async fn add_endpoint(State(state): State<AppState>, Json(config): Json<EndpointConfig>) -> Response {
    match state.orchestrator.registry().add(config) {
        Ok(endpoint) => {
            tracing::info!("Endpoint {} added", endpoint.name());
            (StatusCode::CREATED, Json(json!({ "success": true, "endpoint": endpoint.view() }))).into_response()
        }
        Err(e) => registry_error(e),
    }
}
