// Conversion engine - request/response translation between the three wire formats
//
// OpenAI Chat is the pivot: Anthropic <-> Responses is composed through it.

pub mod anthropic;
pub mod responses;
pub mod sse;
pub mod stream;

use serde_json::Value;

use crate::error::ConversionError;
use crate::proxy::WireFormat;

/// Substituted for an empty text block in converted responses.
pub const EMPTY_TEXT_PLACEHOLDER: &str = "(no content)";

pub type Converter = fn(&Value) -> Result<Value, ConversionError>;

const NONE: &[Converter] = &[];
const ANTHROPIC_TO_CHAT_REQ: &[Converter] = &[anthropic::request_to_chat];
const CHAT_TO_ANTHROPIC_REQ: &[Converter] = &[anthropic::request_from_chat];
const RESPONSES_TO_CHAT_REQ: &[Converter] = &[responses::request_to_chat];
const CHAT_TO_RESPONSES_REQ: &[Converter] = &[responses::request_from_chat];
const ANTHROPIC_TO_RESPONSES_REQ: &[Converter] =
    &[anthropic::request_to_chat, responses::request_from_chat];
const RESPONSES_TO_ANTHROPIC_REQ: &[Converter] =
    &[responses::request_to_chat, anthropic::request_from_chat];

const ANTHROPIC_TO_CHAT_RESP: &[Converter] = &[anthropic::response_to_chat];
const CHAT_TO_ANTHROPIC_RESP: &[Converter] = &[anthropic::response_from_chat];
const RESPONSES_TO_CHAT_RESP: &[Converter] = &[responses::response_to_chat];
const CHAT_TO_RESPONSES_RESP: &[Converter] = &[responses::response_from_chat];
const ANTHROPIC_TO_RESPONSES_RESP: &[Converter] =
    &[anthropic::response_to_chat, responses::response_from_chat];
const RESPONSES_TO_ANTHROPIC_RESP: &[Converter] =
    &[responses::response_to_chat, anthropic::response_from_chat];

/// Request converters taking a body in `from` to a body in `to`.
pub fn request_chain(from: WireFormat, to: WireFormat) -> &'static [Converter] {
    use WireFormat::*;
    match (from, to) {
        (Anthropic, OpenAIChat) => ANTHROPIC_TO_CHAT_REQ,
        (OpenAIChat, Anthropic) => CHAT_TO_ANTHROPIC_REQ,
        (OpenAIResponses, OpenAIChat) => RESPONSES_TO_CHAT_REQ,
        (OpenAIChat, OpenAIResponses) => CHAT_TO_RESPONSES_REQ,
        (Anthropic, OpenAIResponses) => ANTHROPIC_TO_RESPONSES_REQ,
        (OpenAIResponses, Anthropic) => RESPONSES_TO_ANTHROPIC_REQ,
        _ => NONE,
    }
}

/// Response converters taking a body in `from` to a body in `to`.
pub fn response_chain(from: WireFormat, to: WireFormat) -> &'static [Converter] {
    use WireFormat::*;
    match (from, to) {
        (Anthropic, OpenAIChat) => ANTHROPIC_TO_CHAT_RESP,
        (OpenAIChat, Anthropic) => CHAT_TO_ANTHROPIC_RESP,
        (OpenAIResponses, OpenAIChat) => RESPONSES_TO_CHAT_RESP,
        (OpenAIChat, OpenAIResponses) => CHAT_TO_RESPONSES_RESP,
        (Anthropic, OpenAIResponses) => ANTHROPIC_TO_RESPONSES_RESP,
        (OpenAIResponses, Anthropic) => RESPONSES_TO_ANTHROPIC_RESP,
        _ => NONE,
    }
}

fn run_chain(chain: &[Converter], body: &Value) -> Result<Value, ConversionError> {
    let mut current = body.clone();
    for convert in chain {
        current = convert(&current)?;
    }
    Ok(current)
}

/// Identifies one translation: client format, upstream format, streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionDescriptor {
    pub client: WireFormat,
    pub upstream: WireFormat,
    pub streaming: bool,
}

impl ConversionDescriptor {
    pub fn new(client: WireFormat, upstream: WireFormat, streaming: bool) -> Self {
        Self {
            client,
            upstream,
            streaming,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.client == self.upstream
    }

    /// Client request body -> upstream request body.
    pub fn convert_request(&self, body: &Value) -> Result<Value, ConversionError> {
        if !body.is_object() {
            return Err(ConversionError::invalid("body", "expected a JSON object"));
        }
        let mut converted = run_chain(request_chain(self.client, self.upstream), body)?;
        if let Some(obj) = converted.as_object_mut() {
            if self.streaming {
                obj.insert("stream".to_string(), Value::Bool(true));
            } else {
                obj.remove("stream");
            }
        }
        Ok(converted)
    }

    /// Upstream response body -> client response body.
    pub fn convert_response(&self, body: &Value) -> Result<Value, ConversionError> {
        run_chain(response_chain(self.upstream, self.client), body)
    }

    /// Upstream response body -> normalized Chat completion.
    pub fn response_to_chat(&self, body: &Value) -> Result<Value, ConversionError> {
        run_chain(response_chain(self.upstream, WireFormat::OpenAIChat), body)
    }

    /// Normalized Chat completion -> client response body.
    pub fn chat_to_client(&self, chat: &Value) -> Result<Value, ConversionError> {
        run_chain(response_chain(WireFormat::OpenAIChat, self.client), chat)
    }
}

/// Parse raw upstream bytes as JSON, mapping failures to a conversion error.
pub fn parse_json(bytes: &[u8]) -> Result<Value, ConversionError> {
    serde_json::from_slice(bytes).map_err(|e| ConversionError::not_json(&e))
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

/// Tool arguments / outputs as a string, serializing non-string JSON.
pub(crate) fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn short_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..24])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_lengths() {
        for from in WireFormat::ALL {
            for to in WireFormat::ALL {
                let expected = if from == to {
                    0
                } else if from.is_openai() && to.is_openai() || from == WireFormat::OpenAIChat || to == WireFormat::OpenAIChat {
                    1
                } else {
                    2
                };
                assert_eq!(request_chain(from, to).len(), expected, "{} -> {}", from, to);
                assert_eq!(response_chain(from, to).len(), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_convert_request_sets_stream_flag() {
        let descriptor = ConversionDescriptor::new(WireFormat::OpenAIChat, WireFormat::OpenAIChat, false);
        assert!(descriptor.is_passthrough());
        let out = descriptor
            .convert_request(&json!({"model": "m", "messages": [], "stream": true}))
            .unwrap();
        assert!(out.get("stream").is_none());

        let descriptor = ConversionDescriptor::new(WireFormat::OpenAIChat, WireFormat::Anthropic, true);
        let out = descriptor
            .convert_request(&json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
            .unwrap();
        assert_eq!(out["stream"], json!(true));
    }

    #[test]
    fn test_non_object_body_is_rejected() {
        let descriptor = ConversionDescriptor::new(WireFormat::Anthropic, WireFormat::OpenAIChat, false);
        let err = descriptor.convert_request(&json!([1, 2])).unwrap_err();
        assert_eq!(err.field, "body");
        assert!(parse_json(b"not json").is_err());
    }

    #[test]
    fn test_anthropic_round_trip_through_chat_preserves_text_and_tools() {
        let original = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "what's the weather?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "sunny"}
                ]}
            ],
            "tools": [{"name": "get_weather", "description": "d", "input_schema": {"type": "object"}}]
        });

        let chat = anthropic::request_to_chat(&original).unwrap();
        let back = anthropic::request_from_chat(&chat).unwrap();
        let chat_again = anthropic::request_to_chat(&back).unwrap();

        assert_eq!(chat["messages"], chat_again["messages"]);
        assert_eq!(back["system"], "be brief");
        assert_eq!(back["messages"][1]["content"][1]["name"], "get_weather");
        assert_eq!(back["messages"][1]["content"][1]["input"], json!({"city": "Paris"}));
        assert_eq!(back["messages"][2]["content"][0]["content"], "sunny");
    }
}
