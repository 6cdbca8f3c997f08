// Proxy module - endpoint registry, selection, health and the retry loop

pub mod classifier;
pub mod health;
pub mod learning;
pub mod model_rewrite;
pub mod orchestrator;
pub mod registry;
pub mod selector;
pub mod upstream;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ErrorCategory;

/// The three JSON/SSE schemas spoken by clients and upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireFormat {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai_chat")]
    OpenAIChat,
    #[serde(rename = "openai_responses")]
    OpenAIResponses,
}

impl WireFormat {
    pub const ALL: [WireFormat; 3] = [
        WireFormat::Anthropic,
        WireFormat::OpenAIChat,
        WireFormat::OpenAIResponses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Anthropic => "anthropic",
            WireFormat::OpenAIChat => "openai_chat",
            WireFormat::OpenAIResponses => "openai_responses",
        }
    }

    /// Path appended to an endpoint base URL for this format.
    pub fn upstream_path(&self) -> &'static str {
        match self {
            WireFormat::Anthropic => "/v1/messages",
            WireFormat::OpenAIChat => "/chat/completions",
            WireFormat::OpenAIResponses => "/responses",
        }
    }

    pub fn is_openai(&self) -> bool {
        matches!(self, WireFormat::OpenAIChat | WireFormat::OpenAIResponses)
    }

    /// The other OpenAI sub-format.
    pub fn openai_sibling(&self) -> Option<WireFormat> {
        match self {
            WireFormat::OpenAIChat => Some(WireFormat::OpenAIResponses),
            WireFormat::OpenAIResponses => Some(WireFormat::OpenAIChat),
            WireFormat::Anthropic => None,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientType {
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "generic")]
    Generic,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::ClaudeCode => "claude-code",
            ClientType::Codex => "codex",
            ClientType::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    ConversionFailed,
    Failed(ErrorCategory),
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::ConversionFailed => "conversion_failed",
            AttemptOutcome::Failed(category) => category.as_str(),
        }
    }
}

/// One line of the per-request trace.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub endpoint: String,
    pub upstream_format: Option<WireFormat>,
    pub outcome: AttemptOutcome,
    pub status: Option<u16>,
    pub detail: String,
}

/// State of one inbound client call. Never persisted.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,
    pub client_type: ClientType,
    pub format: WireFormat,
    pub stream: bool,
    pub body: Value,
    /// Routing filter; every tag must be present on the endpoint.
    pub tags: Vec<String>,
    /// Body sent on the current attempt, after rewrite and conversion.
    pub attempt_body: Option<Value>,
    pub attempts: u32,
    pub trace: Vec<AttemptRecord>,
    /// Credential presented by the client, forwarded when an endpoint has none.
    pub client_credential: Option<String>,
    pub anthropic_beta: Option<String>,
}

impl RequestContext {
    pub fn new(client_type: ClientType, format: WireFormat, body: Value) -> Self {
        let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            client_type,
            format,
            stream,
            body,
            tags: Vec::new(),
            attempt_body: None,
            attempts: 0,
            trace: Vec::new(),
            client_credential: None,
            anthropic_beta: None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(|v| v.as_str())
    }

    pub fn record(&mut self, record: AttemptRecord) {
        tracing::debug!(
            request = %self.id,
            endpoint = %record.endpoint,
            outcome = record.outcome.as_str(),
            status = ?record.status,
            "attempt finished: {}",
            record.detail
        );
        self.trace.push(record);
    }

    /// Endpoint names and outcome kinds, safe to show to clients.
    pub fn trace_summary(&self) -> String {
        self.trace
            .iter()
            .map(|r| match r.status {
                Some(status) => format!("{}: {} ({})", r.endpoint, r.outcome.as_str(), status),
                None => format!("{}: {}", r.endpoint, r.outcome.as_str()),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
