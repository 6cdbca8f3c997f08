// API request handlers

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use std::time::Instant;

use super::{streaming, AppState};
use crate::error::ProxyError;
use crate::proxy::classifier;
use crate::proxy::health::HealthStatus;
use crate::proxy::learning;
use crate::proxy::model_rewrite;
use crate::proxy::registry::Endpoint;
use crate::proxy::upstream::ANTHROPIC_VERSION;
use crate::proxy::{RequestContext, WireFormat};

pub const TAGS_HEADER: &str = "x-relay-tags";

// Root endpoint
pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "Relay Proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at.to_rfc3339(),
        "endpoints": [
            "POST /v1/messages",
            "POST /v1/messages/count_tokens",
            "POST /v1/chat/completions",
            "POST /v1/responses",
            "GET /health",
            "GET /management/endpoints"
        ]
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "endpoints": state.orchestrator.registry().len(),
    }))
}

/// Every proxied format lands here; the classifier decides what it is.
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return (
            StatusCode::NOT_FOUND,
            Json(crate::error::error_body("not_found", &format!("no route for {} {}", method, uri.path()))),
        )
            .into_response();
    }

    match forward(&state, uri.path(), &headers, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward(state: &AppState, path: &str, headers: &HeaderMap, body: &[u8]) -> Result<Response, ProxyError> {
    let body: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("request body is not valid JSON: {}", e)))?;
    if !body.is_object() {
        return Err(ProxyError::BadRequest("request body must be a JSON object".to_string()));
    }

    let user_agent = header_str(headers, "user-agent");
    let classification = classifier::classify(path, Some(&body), user_agent);
    let format = classification.effective_format();
    tracing::debug!(
        "Classified {} as {} from {:?} ({:.1})",
        path,
        format,
        classification.detected_by,
        classification.confidence
    );

    let mut ctx = RequestContext::new(classification.client_type, format, body);
    ctx.tags = request_tags(headers);
    ctx.client_credential = client_credential(headers);
    ctx.anthropic_beta = header_str(headers, "anthropic-beta").map(str::to_string);

    tracing::info!(
        request = %ctx.id,
        "{} {} request for {} (stream={})",
        ctx.client_type.as_str(),
        format,
        ctx.model().unwrap_or("-"),
        ctx.stream
    );

    let outcome = state.orchestrator.handle(ctx).await?;
    Ok(streaming::outcome_response(outcome))
}

/// `POST /v1/messages/count_tokens`: forwarded when an endpoint allows it,
/// otherwise estimated locally.
pub async fn count_tokens(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return ProxyError::BadRequest(format!("request body is not valid JSON: {}", e)).into_response(),
    };

    let now = Instant::now();
    let endpoint = state.orchestrator.registry().snapshot().into_iter().find(|e| {
        e.is_enabled()
            && e.config().count_tokens_enabled
            && e.config().url_anthropic.is_some()
            && e.health_status(now) != HealthStatus::Blacklisted
    });

    if let Some(endpoint) = endpoint {
        match forward_count_tokens(&state, &endpoint, &headers, body.clone()).await {
            Ok(counted) => return Json(counted).into_response(),
            Err(e) => tracing::debug!("count_tokens via {} failed, estimating: {}", endpoint.name(), e),
        }
    }

    Json(json!({ "input_tokens": estimate_tokens(&body) })).into_response()
}

async fn forward_count_tokens(
    state: &AppState,
    endpoint: &Endpoint,
    headers: &HeaderMap,
    mut body: Value,
) -> anyhow::Result<Value> {
    let url = endpoint
        .url_for(WireFormat::Anthropic)
        .map(|url| format!("{}/count_tokens", url))
        .ok_or_else(|| anyhow::anyhow!("no anthropic URL"))?;
    model_rewrite::apply_rewrite(&endpoint.config().model_rewrite.rules, &mut body);

    let config = endpoint.config();
    let credential = if !config.auth_value.is_empty() {
        Some(config.auth_value.clone())
    } else if state.api_keys.is_empty() {
        client_credential(headers)
    } else {
        None
    };

    let client = state.orchestrator.client();
    let mut request = client
        .http()
        .post(&url)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .timeout(client.attempt_timeout())
        .json(&body);
    if let Some(beta) = header_str(headers, "anthropic-beta") {
        request = request.header("anthropic-beta", beta);
    }
    if let Some(credential) = credential {
        if let Some(auth) = learning::auth_header_order(config.auth_type, &endpoint.learned()).first() {
            request = request.header(auth.header_name(), auth.header_value(&credential));
        }
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("upstream answered {}", status);
    }
    let counted: Value = response.json().await?;
    if counted.get("input_tokens").is_none() {
        anyhow::bail!("upstream reply has no input_tokens");
    }
    Ok(counted)
}

/// Rough token estimate: one token per four characters of prompt text.
pub fn estimate_tokens(body: &Value) -> u64 {
    let mut chars = 0;
    if let Some(system) = body.get("system") {
        chars += text_chars(system);
    }
    if let Some(messages) = body.get("messages") {
        chars += text_chars(messages);
    }
    if let Some(tools) = body.get("tools") {
        chars += tools.to_string().chars().count();
    }
    (chars as u64).div_ceil(4)
}

fn text_chars(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(text_chars).sum(),
        Value::Object(obj) => obj
            .iter()
            .map(|(key, value)| match key.as_str() {
                "text" | "content" | "thinking" => text_chars(value),
                "input" => value.to_string().chars().count(),
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn request_tags(headers: &HeaderMap) -> Vec<String> {
    header_str(headers, TAGS_HEADER)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The key the client presented, as `x-api-key`, `Bearer <key>` or a raw
/// `Authorization` value.
pub(crate) fn client_credential(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-api-key")
        .or_else(|| header_str(headers, "authorization").map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth)))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::proxy::health::HealthSettings;
    use crate::proxy::learning::NoopSink;
    use crate::proxy::orchestrator::{Orchestrator, OrchestratorSettings};
    use crate::proxy::registry::Registry;
    use crate::proxy::upstream::UpstreamClient;
    use axum::{http::HeaderValue, routing::post, Router};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_count_tokens_forwarded_with_version_header() {
        let app = Router::new().route(
            "/v1/messages/count_tokens",
            post(|headers: HeaderMap| async move {
                let version = headers.get("anthropic-version").and_then(|v| v.to_str().ok()).unwrap_or("");
                let tokens = if version == ANTHROPIC_VERSION { 42 } else { 0 };
                Json(json!({"input_tokens": tokens}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = EndpointConfig::new("counter");
        config.url_anthropic = Some(format!("http://{}", addr));
        config.count_tokens_enabled = true;
        let registry = Arc::new(Registry::new(vec![config], HealthSettings::default()).unwrap());
        let orchestrator = Orchestrator::new(
            registry,
            Arc::new(NoopSink),
            UpstreamClient::new(Duration::from_secs(1), Duration::from_secs(2)).unwrap(),
            OrchestratorSettings::default(),
        );
        let state = AppState::new(Arc::new(orchestrator), Vec::new());

        let body = json!({"model": "m", "messages": [{"role": "user", "content": "hello"}]});
        let response = count_tokens(State(state), HeaderMap::new(), Bytes::from(body.to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let counted: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(counted, json!({"input_tokens": 42}));
    }

    #[test]
    fn test_request_tags() {
        let mut headers = HeaderMap::new();
        headers.insert(TAGS_HEADER, HeaderValue::from_static("fast, cheap,,"));
        assert_eq!(request_tags(&headers), vec!["fast".to_string(), "cheap".to_string()]);
        assert!(request_tags(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn test_client_credential_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-1"));
        assert_eq!(client_credential(&headers).as_deref(), Some("sk-1"));

        headers.insert("x-api-key", HeaderValue::from_static("sk-2"));
        assert_eq!(client_credential(&headers).as_deref(), Some("sk-2"));

        assert_eq!(client_credential(&HeaderMap::new()), None);
    }

    #[test]
    fn test_estimate_tokens() {
        let body = json!({
            "system": "12345678",
            "messages": [
                {"role": "user", "content": "abcd"},
                {"role": "assistant", "content": [{"type": "text", "text": "efgh"}]}
            ]
        });
        // 8 + 4 + 4 characters
        assert_eq!(estimate_tokens(&body), 4);
        assert_eq!(estimate_tokens(&json!({"messages": [{"role": "user", "content": "a"}]})), 1);
        assert_eq!(estimate_tokens(&json!({})), 0);
    }
}
