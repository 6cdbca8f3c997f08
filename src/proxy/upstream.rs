// Upstream HTTP client - one POST per attempt, bounded by a per-attempt timeout

use anyhow::Result;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::WireFormat;
use crate::config::AuthHeader;

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";
const USER_AGENT: &str = concat!("relay-proxy/", env!("CARGO_PKG_VERSION"));

/// Everything needed to send one attempt.
#[derive(Debug)]
pub struct UpstreamRequest<'a> {
    pub url: String,
    pub format: WireFormat,
    pub body: &'a Value,
    pub stream: bool,
    pub auth: Option<(AuthHeader, &'a str)>,
    pub anthropic_beta: Option<&'a str>,
}

#[derive(Debug)]
pub enum UpstreamReply {
    /// 2xx; the body has not been read yet.
    Success {
        response: reqwest::Response,
        latency: Duration,
        is_sse: bool,
    },
    /// Non-2xx, with the body read in full.
    Rejected {
        status: u16,
        body: String,
        latency: Duration,
    },
}

/// Connection-level failure: nothing usable came back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    attempt_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(connect_timeout: Duration, attempt_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            attempt_timeout,
        })
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send and wait for response headers. Error bodies are read within the
    /// same timeout.
    pub async fn send(&self, request: &UpstreamRequest<'_>) -> Result<UpstreamReply, TransportError> {
        let started = Instant::now();
        let mut req = self
            .http
            .post(&request.url)
            .header("content-type", "application/json")
            .json(request.body);

        req = if request.stream {
            req.header("accept", "text/event-stream")
        } else {
            req.header("accept", "application/json")
        };

        if request.format == WireFormat::Anthropic {
            req = req.header("anthropic-version", ANTHROPIC_VERSION);
            if let Some(beta) = request.anthropic_beta {
                req = req.header("anthropic-beta", beta);
            }
        }

        if let Some((header, credential)) = request.auth {
            req = req.header(header.header_name(), header.header_value(credential));
        }

        tracing::debug!(
            "POST {} ({}, stream={})",
            request.url,
            request.format,
            request.stream
        );

        let timeout = self.attempt_timeout;
        let response = match tokio::time::timeout(timeout, req.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        let status = response.status();
        if status.is_success() {
            let is_sse = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("text/event-stream"))
                .unwrap_or(false);
            return Ok(UpstreamReply::Success {
                response,
                latency: started.elapsed(),
                is_sse,
            });
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        let body = match tokio::time::timeout(remaining, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => format!("failed to read error body: {}", e),
            Err(_) => String::new(),
        };
        Ok(UpstreamReply::Rejected {
            status: status.as_u16(),
            body,
            latency: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use serde_json::json;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> UpstreamClient {
        UpstreamClient::new(Duration::from_secs(2), Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn test_sends_auth_and_version_headers() {
        let app = Router::new().route(
            "/v1/messages",
            post(|headers: HeaderMap| async move {
                Json(json!({
                    "key": headers.get("x-api-key").and_then(|v| v.to_str().ok()),
                    "version": headers.get("anthropic-version").and_then(|v| v.to_str().ok()),
                    "beta": headers.get("anthropic-beta").and_then(|v| v.to_str().ok()),
                }))
            }),
        );
        let base = spawn(app).await;
        let body = json!({"model": "m"});
        let reply = client()
            .send(&UpstreamRequest {
                url: format!("{}/v1/messages", base),
                format: WireFormat::Anthropic,
                body: &body,
                stream: false,
                auth: Some((AuthHeader::ApiKey, "sk-1")),
                anthropic_beta: Some("tools-2024"),
            })
            .await
            .unwrap();
        let UpstreamReply::Success { response, is_sse, .. } = reply else {
            panic!("expected success");
        };
        assert!(!is_sse);
        let echoed: Value = response.json().await.unwrap();
        assert_eq!(echoed["key"], "sk-1");
        assert_eq!(echoed["version"], ANTHROPIC_VERSION);
        assert_eq!(echoed["beta"], "tools-2024");
    }

    #[tokio::test]
    async fn test_rejection_carries_status_and_body() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"message": "parameter 'top_p' is not supported"}})),
                )
            }),
        );
        let base = spawn(app).await;
        let body = json!({});
        let reply = client()
            .send(&UpstreamRequest {
                url: format!("{}/chat/completions", base),
                format: WireFormat::OpenAIChat,
                body: &body,
                stream: false,
                auth: Some((AuthHeader::Bearer, "sk-2")),
                anthropic_beta: None,
            })
            .await
            .unwrap();
        match reply {
            UpstreamReply::Rejected { status, body, .. } => {
                assert_eq!(status, 400);
                assert!(body.contains("top_p"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let app = Router::new().route(
            "/responses",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        );
        let base = spawn(app).await;
        let body = json!({});
        let err = client()
            .send(&UpstreamRequest {
                url: format!("{}/responses", base),
                format: WireFormat::OpenAIResponses,
                body: &body,
                stream: false,
                auth: None,
                anthropic_beta: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(err.to_string().starts_with("timed out after"));
    }

    #[test]
    fn test_transport_error_messages() {
        assert_eq!(TransportError::Timeout(Duration::from_secs(30)).to_string(), "timed out after 30s");
        assert_eq!(
            TransportError::Connect("refused".into()).to_string(),
            "connection failed: refused"
        );
        let source: &dyn std::error::Error = &TransportError::Connect("refused".into());
        assert!(source.source().is_none());
    }
}
