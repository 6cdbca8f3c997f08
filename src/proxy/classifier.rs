//! Inbound format detection.
//!
//! Path rules win; ambiguous or root paths fall back to the body shape.
//! Pure and side-effect free.

use serde_json::Value;

use super::{ClientType, WireFormat};

const PATH_CONFIDENCE: f32 = 1.0;
const BODY_CONFIDENCE: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedBy {
    Path,
    Body,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub client_type: ClientType,
    /// `None` when neither path nor body identified the format.
    pub format: Option<WireFormat>,
    pub confidence: f32,
    pub detected_by: DetectedBy,
}

impl Classification {
    /// Unknown requests are handled as Anthropic for backward compatibility.
    pub fn effective_format(&self) -> WireFormat {
        self.format.unwrap_or(WireFormat::Anthropic)
    }
}

pub fn classify(path: &str, body: Option<&Value>, user_agent: Option<&str>) -> Classification {
    let (format, confidence, detected_by) = match format_from_path(path) {
        Some(format) => (Some(format), PATH_CONFIDENCE, DetectedBy::Path),
        None => match body.and_then(format_from_body) {
            Some(format) => (Some(format), BODY_CONFIDENCE, DetectedBy::Body),
            None => (None, 0.0, DetectedBy::Default),
        },
    };

    Classification {
        client_type: client_type_for(format, user_agent),
        format,
        confidence,
        detected_by,
    }
}

pub fn format_from_path(path: &str) -> Option<WireFormat> {
    let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
    match path {
        "/v1/messages" => Some(WireFormat::Anthropic),
        "/responses" | "/v1/responses" => Some(WireFormat::OpenAIResponses),
        "/chat/completions" | "/v1/chat/completions" => Some(WireFormat::OpenAIChat),
        _ => None,
    }
}

pub fn format_from_body(body: &Value) -> Option<WireFormat> {
    let obj = body.as_object()?;

    if let Some(input) = obj.get("input").and_then(|v| v.as_array()) {
        if input.iter().all(|item| item.is_object()) {
            return Some(WireFormat::OpenAIResponses);
        }
    }

    let messages = obj.get("messages").and_then(|v| v.as_array());
    if messages.is_some() && obj.contains_key("max_tokens") && !obj.contains_key("choices") {
        // Chat requests may also carry max_tokens; the system-role message
        // and string contents tell them apart.
        if !has_openai_only_markers(obj) {
            return Some(WireFormat::Anthropic);
        }
    }

    if let Some(messages) = messages {
        let has_input_schema = obj
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|tools| tools.iter().any(|t| t.get("input_schema").is_some()))
            .unwrap_or(false);
        let openai_messages = messages.iter().all(|m| {
            m.get("role").and_then(|v| v.as_str()).is_some()
                && m.get("content").map(|c| c.is_string() || c.is_null() || c.is_array()).unwrap_or(true)
        });
        if openai_messages && !has_input_schema {
            return Some(WireFormat::OpenAIChat);
        }
        if has_input_schema {
            return Some(WireFormat::Anthropic);
        }
    }

    None
}

fn has_openai_only_markers(obj: &serde_json::Map<String, Value>) -> bool {
    let system_role = obj
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|messages| {
            messages.iter().any(|m| {
                matches!(
                    m.get("role").and_then(|v| v.as_str()),
                    Some("system") | Some("developer") | Some("tool")
                )
            })
        })
        .unwrap_or(false);
    let function_tools = obj
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|tools| tools.iter().any(|t| t.get("function").is_some()))
        .unwrap_or(false);
    system_role || function_tools
}

fn client_type_for(format: Option<WireFormat>, user_agent: Option<&str>) -> ClientType {
    if let Some(agent) = user_agent.map(|ua| ua.to_lowercase()) {
        if agent.contains("claude-cli") || agent.contains("claude-code") {
            return ClientType::ClaudeCode;
        }
        if agent.contains("codex") {
            return ClientType::Codex;
        }
    }
    match format {
        Some(WireFormat::Anthropic) | None => ClientType::ClaudeCode,
        Some(WireFormat::OpenAIResponses) => ClientType::Codex,
        Some(WireFormat::OpenAIChat) => ClientType::Generic,
    }
}
