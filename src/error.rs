// Error taxonomy shared by the proxy core and the HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Upstream failure classes used for health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller-content problem (unsupported model, invalid argument, policy).
    Business,
    /// Auth rejected or request malformed because of endpoint configuration.
    Config,
    /// 5xx, timeouts and connection failures.
    Server,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Business => "business_error",
            ErrorCategory::Config => "config_error",
            ErrorCategory::Server => "server_error",
        }
    }
}

/// A body could not be translated between wire formats.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conversion failed at `{field}`: {reason}")]
pub struct ConversionError {
    pub field: String,
    pub reason: String,
}

impl ConversionError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: "required field is missing".to_string(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_json(err: &serde_json::Error) -> Self {
        Self {
            field: "body".to_string(),
            reason: format!("not valid JSON: {}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("endpoint `{0}` already exists")]
    Duplicate(String),
    #[error("endpoint `{0}` not found")]
    NotFound(String),
    #[error("endpoint `{0}` has no upstream URL configured")]
    NoUrl(String),
}

/// Errors surfaced to the inbound client.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("upstream rejected the request with status {status}")]
    Business { status: u16, message: String },

    #[error("upstream configuration error (status {status})")]
    Config { status: u16, message: String },

    #[error("upstream server error: {message}")]
    Server { status: Option<u16>, message: String },

    #[error("invalid or missing API key")]
    Auth,

    #[error("no available endpoint for {format}")]
    NoCandidate { format: String, detail: String },

    #[error("failed to forward request: {0}")]
    Forward(String),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Conversion(_) => "conversion_failed",
            ProxyError::Business { .. } | ProxyError::Config { .. } | ProxyError::Server { .. } => {
                "upstream_error"
            }
            ProxyError::Auth => "unauthorized_token",
            ProxyError::NoCandidate { .. } => "no_available_endpoints",
            ProxyError::Forward(_) => "proxy_forward_failed",
            ProxyError::BadRequest(_) => "invalid_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        let upstream = |status: u16| StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        match self {
            ProxyError::Conversion(_) | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Business { status, .. } | ProxyError::Config { status, .. } => upstream(*status),
            ProxyError::Server { status: Some(status), .. } => upstream(*status),
            ProxyError::Server { status: None, .. } | ProxyError::Forward(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Auth => StatusCode::UNAUTHORIZED,
            ProxyError::NoCandidate { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn message(&self) -> String {
        match self {
            ProxyError::Business { message, .. }
            | ProxyError::Config { message, .. }
            | ProxyError::Server { message, .. } => message.clone(),
            ProxyError::NoCandidate { format, detail } if !detail.is_empty() => {
                format!("no available endpoint for {} ({})", format, detail)
            }
            other => other.to_string(),
        }
    }
}

/// The `{success:false, error:{code,message}}` envelope returned on failure.
pub fn error_body(code: &str, message: &str) -> Value {
    json!({
        "success": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = error_body(self.code(), &self.message());
        (self.status(), Json(body)).into_response()
    }
}
