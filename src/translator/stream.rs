// Streaming conversion
//
// Upstream SSE frames are decoded into format-neutral `StreamEvent`s, then
// re-encoded for the client by a `StreamAccumulator`. Tool calls are buffered
// until complete and emitted as one discrete event each.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::sse::{encode_data, encode_event, SseFrame, DEFAULT_MAX_BUFFERED_BYTES, DONE_FRAME};
use super::{anthropic, responses, short_id, str_field, ConversionDescriptor, EMPTY_TEXT_PLACEHOLDER};
use crate::error::ConversionError;
use crate::proxy::WireFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Prompt tokens, cached ones included.
    pub input: u64,
    pub output: u64,
    pub cached: u64,
    pub reasoning: u64,
}

impl Usage {
    fn merge(&mut self, other: Usage) {
        for (mine, theirs) in [
            (&mut self.input, other.input),
            (&mut self.output, other.output),
            (&mut self.cached, other.cached),
            (&mut self.reasoning, other.reasoning),
        ] {
            if theirs > 0 {
                *mine = theirs;
            }
        }
    }

    fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn from_chat(reason: &str) -> Self {
        match reason {
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    pub fn as_chat(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
        }
    }
}

/// Format-neutral streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        id: Option<String>,
        model: Option<String>,
    },
    TextDelta(String),
    ReasoningDelta(String),
    /// Fragment of tool call `index`; `id` and `name` usually arrive once.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    ToolCallEnd {
        index: usize,
    },
    Usage(Usage),
    Finish(FinishReason),
    Error(String),
    Done,
}

/// Turns upstream SSE frames of one wire format into stream events.
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &SseFrame) -> Vec<StreamEvent>;
}

pub fn decoder_for(format: WireFormat) -> Box<dyn StreamDecoder> {
    match format {
        WireFormat::Anthropic => Box::new(AnthropicDecoder::default()),
        WireFormat::OpenAIChat => Box::new(ChatDecoder::default()),
        WireFormat::OpenAIResponses => Box::new(ResponsesDecoder::default()),
    }
}

fn frame_type(frame: &SseFrame, data: &Value) -> String {
    str_field(data, "type")
        .map(str::to_string)
        .or_else(|| frame.event.clone())
        .unwrap_or_default()
}

fn error_text(data: &Value) -> String {
    data.pointer("/error/message")
        .or_else(|| data.get("message"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string())
}

fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(|v| v.as_u64()).unwrap_or(0)
}

#[derive(Debug, Default)]
struct AnthropicDecoder {
    /// content block index -> tool ordinal
    tool_blocks: HashMap<u64, usize>,
    next_tool: usize,
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let Some(data) = frame.json() else {
            return Vec::new();
        };
        let block_index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        match frame_type(frame, &data).as_str() {
            "message_start" => {
                let message = data.get("message").cloned().unwrap_or_else(|| json!({}));
                let cached = u64_at(&message, "/usage/cache_read_input_tokens");
                let usage = Usage {
                    input: u64_at(&message, "/usage/input_tokens")
                        + cached
                        + u64_at(&message, "/usage/cache_creation_input_tokens"),
                    output: u64_at(&message, "/usage/output_tokens"),
                    cached,
                    reasoning: 0,
                };
                // Usage first, so the client preamble can carry input tokens.
                vec![
                    StreamEvent::Usage(usage),
                    StreamEvent::Start {
                        id: str_field(&message, "id").map(str::to_string),
                        model: str_field(&message, "model").map(str::to_string),
                    },
                ]
            }
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or_else(|| json!({}));
                match str_field(&block, "type") {
                    Some("tool_use") | Some("server_tool_use") => {
                        let ordinal = self.next_tool;
                        self.next_tool += 1;
                        self.tool_blocks.insert(block_index, ordinal);
                        vec![StreamEvent::ToolCallDelta {
                            index: ordinal,
                            id: str_field(&block, "id").map(str::to_string),
                            name: str_field(&block, "name").map(str::to_string),
                            arguments: String::new(),
                        }]
                    }
                    Some("text") => match str_field(&block, "text").filter(|t| !t.is_empty()) {
                        Some(text) => vec![StreamEvent::TextDelta(text.to_string())],
                        None => Vec::new(),
                    },
                    Some("thinking") => match str_field(&block, "thinking").filter(|t| !t.is_empty()) {
                        Some(text) => vec![StreamEvent::ReasoningDelta(text.to_string())],
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let delta = data.get("delta").cloned().unwrap_or_else(|| json!({}));
                match str_field(&delta, "type") {
                    Some("text_delta") => {
                        vec![StreamEvent::TextDelta(str_field(&delta, "text").unwrap_or("").to_string())]
                    }
                    Some("thinking_delta") => vec![StreamEvent::ReasoningDelta(
                        str_field(&delta, "thinking").unwrap_or("").to_string(),
                    )],
                    Some("input_json_delta") => match self.tool_blocks.get(&block_index) {
                        Some(ordinal) => vec![StreamEvent::ToolCallDelta {
                            index: *ordinal,
                            id: None,
                            name: None,
                            arguments: str_field(&delta, "partial_json").unwrap_or("").to_string(),
                        }],
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => match self.tool_blocks.get(&block_index) {
                Some(ordinal) => vec![StreamEvent::ToolCallEnd { index: *ordinal }],
                None => Vec::new(),
            },
            "message_delta" => {
                let mut events = Vec::new();
                if data.get("usage").is_some() {
                    let cached = u64_at(&data, "/usage/cache_read_input_tokens");
                    events.push(StreamEvent::Usage(Usage {
                        input: u64_at(&data, "/usage/input_tokens") + cached,
                        output: u64_at(&data, "/usage/output_tokens"),
                        cached,
                        reasoning: 0,
                    }));
                }
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(|v| v.as_str()) {
                    events.push(StreamEvent::Finish(FinishReason::from_chat(anthropic::map_stop_reason(
                        reason,
                    ))));
                }
                events
            }
            "message_stop" => vec![StreamEvent::Done],
            "error" => vec![StreamEvent::Error(error_text(&data))],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ChatDecoder {
    started: bool,
}

impl StreamDecoder for ChatDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        if frame.is_done() {
            return vec![StreamEvent::Done];
        }
        let Some(data) = frame.json() else {
            return Vec::new();
        };
        if data.get("error").is_some() {
            return vec![StreamEvent::Error(error_text(&data))];
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start {
                id: str_field(&data, "id").map(str::to_string),
                model: str_field(&data, "model").map(str::to_string),
            });
        }

        if let Some(choice) = data.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) {
            if let Some(delta) = choice.get("delta") {
                let reasoning = str_field(delta, "reasoning_content").or_else(|| str_field(delta, "reasoning"));
                if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
                    events.push(StreamEvent::ReasoningDelta(text.to_string()));
                }
                if let Some(text) = str_field(delta, "content").filter(|t| !t.is_empty()) {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
                if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for (position, call) in calls.iter().enumerate() {
                        let index = call
                            .get("index")
                            .and_then(|v| v.as_u64())
                            .map(|i| i as usize)
                            .unwrap_or(position);
                        events.push(StreamEvent::ToolCallDelta {
                            index,
                            id: str_field(call, "id").filter(|s| !s.is_empty()).map(str::to_string),
                            name: call
                                .pointer("/function/name")
                                .and_then(|v| v.as_str())
                                .filter(|s| !s.is_empty())
                                .map(str::to_string),
                            arguments: call
                                .pointer("/function/arguments")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                        });
                    }
                }
            }
            if let Some(reason) = str_field(choice, "finish_reason") {
                events.push(StreamEvent::Finish(FinishReason::from_chat(reason)));
            }
        }

        if let Some(usage) = data.get("usage").filter(|u| u.is_object()) {
            events.push(StreamEvent::Usage(Usage {
                input: u64_at(usage, "/prompt_tokens"),
                output: u64_at(usage, "/completion_tokens"),
                cached: u64_at(usage, "/prompt_tokens_details/cached_tokens"),
                reasoning: u64_at(usage, "/completion_tokens_details/reasoning_tokens"),
            }));
        }
        events
    }
}

#[derive(Debug, Default)]
struct ResponsesDecoder {
    /// output_index -> tool ordinal
    tool_items: HashMap<u64, usize>,
    /// ordinals that received argument deltas
    streamed_arguments: HashSet<usize>,
    next_tool: usize,
}

impl ResponsesDecoder {
    fn open_tool(&mut self, output_index: u64, item: &Value) -> (usize, StreamEvent) {
        let ordinal = self.next_tool;
        self.next_tool += 1;
        self.tool_items.insert(output_index, ordinal);
        let event = StreamEvent::ToolCallDelta {
            index: ordinal,
            id: str_field(item, "call_id")
                .or_else(|| str_field(item, "id"))
                .map(str::to_string),
            name: str_field(item, "name").map(str::to_string),
            arguments: String::new(),
        };
        (ordinal, event)
    }
}

impl StreamDecoder for ResponsesDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let Some(data) = frame.json() else {
            return Vec::new();
        };
        let output_index = data.get("output_index").and_then(|v| v.as_u64()).unwrap_or(0);
        match frame_type(frame, &data).as_str() {
            "response.created" => vec![StreamEvent::Start {
                id: data.pointer("/response/id").and_then(|v| v.as_str()).map(str::to_string),
                model: data.pointer("/response/model").and_then(|v| v.as_str()).map(str::to_string),
            }],
            "response.output_text.delta" | "response.refusal.delta" => {
                vec![StreamEvent::TextDelta(str_field(&data, "delta").unwrap_or("").to_string())]
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                vec![StreamEvent::ReasoningDelta(str_field(&data, "delta").unwrap_or("").to_string())]
            }
            "response.output_item.added" => {
                let item = data.get("item").cloned().unwrap_or_else(|| json!({}));
                if str_field(&item, "type") != Some("function_call") {
                    return Vec::new();
                }
                let (_, event) = self.open_tool(output_index, &item);
                vec![event]
            }
            "response.function_call_arguments.delta" => match self.tool_items.get(&output_index) {
                Some(ordinal) => {
                    self.streamed_arguments.insert(*ordinal);
                    vec![StreamEvent::ToolCallDelta {
                        index: *ordinal,
                        id: None,
                        name: None,
                        arguments: str_field(&data, "delta").unwrap_or("").to_string(),
                    }]
                }
                None => Vec::new(),
            },
            "response.output_item.done" => {
                let item = data.get("item").cloned().unwrap_or_else(|| json!({}));
                if str_field(&item, "type") != Some("function_call") {
                    return Vec::new();
                }
                let mut events = Vec::new();
                let ordinal = match self.tool_items.get(&output_index) {
                    Some(ordinal) => *ordinal,
                    None => {
                        let (ordinal, event) = self.open_tool(output_index, &item);
                        events.push(event);
                        ordinal
                    }
                };
                // Some upstreams only send the arguments on the finished item.
                if !self.streamed_arguments.contains(&ordinal) {
                    if let Some(arguments) = str_field(&item, "arguments").filter(|a| !a.is_empty()) {
                        events.push(StreamEvent::ToolCallDelta {
                            index: ordinal,
                            id: None,
                            name: None,
                            arguments: arguments.to_string(),
                        });
                    }
                }
                events.push(StreamEvent::ToolCallEnd { index: ordinal });
                events
            }
            "response.completed" | "response.incomplete" => {
                let response = data.get("response").cloned().unwrap_or_else(|| json!({}));
                let usage = Usage {
                    input: u64_at(&response, "/usage/input_tokens"),
                    output: u64_at(&response, "/usage/output_tokens"),
                    cached: u64_at(&response, "/usage/input_tokens_details/cached_tokens"),
                    reasoning: u64_at(&response, "/usage/output_tokens_details/reasoning_tokens"),
                };
                let finish = if self.next_tool > 0 {
                    FinishReason::ToolCalls
                } else {
                    match response.pointer("/incomplete_details/reason").and_then(|v| v.as_str()) {
                        Some("max_output_tokens") => FinishReason::Length,
                        Some("content_filter") => FinishReason::ContentFilter,
                        _ => FinishReason::Stop,
                    }
                };
                vec![
                    StreamEvent::Usage(usage),
                    StreamEvent::Finish(finish),
                    StreamEvent::Done,
                ]
            }
            "response.failed" => {
                let message = data
                    .pointer("/response/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("upstream response failed")
                    .to_string();
                vec![StreamEvent::Error(message)]
            }
            "error" => vec![StreamEvent::Error(error_text(&data))],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing sent to the client yet.
    Started,
    Streaming,
    Completed,
    Aborted,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

#[derive(Debug)]
enum OpenItem {
    Message { id: String, text: String },
    Reasoning { id: String, text: String },
}

/// Encodes stream events for one client format and guarantees exactly one
/// terminal sequence.
#[derive(Debug)]
pub struct StreamAccumulator {
    target: WireFormat,
    state: StreamState,
    id: String,
    model: String,
    model_override: Option<String>,
    created: i64,
    usage: Usage,
    finish: Option<FinishReason>,
    pending_tools: BTreeMap<usize, PendingToolCall>,
    flushed_tools: HashSet<usize>,
    tools_emitted: usize,
    visible_emitted: bool,
    // anthropic
    block_index: usize,
    open_block: Option<BlockKind>,
    // responses
    sequence: u64,
    output_index: usize,
    open_item: Option<OpenItem>,
    output: Vec<Value>,
    /// Cap on the arguments buffered for one tool call.
    max_tool_arguments: usize,
}

impl StreamAccumulator {
    pub fn new(target: WireFormat, model_override: Option<String>) -> Self {
        Self {
            target,
            state: StreamState::Started,
            id: new_response_id(target, None),
            model: model_override.clone().unwrap_or_default(),
            model_override,
            created: chrono::Utc::now().timestamp(),
            usage: Usage::default(),
            finish: None,
            pending_tools: BTreeMap::new(),
            flushed_tools: HashSet::new(),
            tools_emitted: 0,
            visible_emitted: false,
            block_index: 0,
            open_block: None,
            sequence: 0,
            output_index: 0,
            open_item: None,
            output: Vec::new(),
            max_tool_arguments: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }

    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.max_tool_arguments = limit;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, StreamState::Completed | StreamState::Aborted)
    }

    pub fn push(&mut self, event: StreamEvent) -> Vec<String> {
        if self.is_terminated() {
            return Vec::new();
        }
        let mut out = Vec::new();
        match event {
            StreamEvent::Start { id, model } => {
                if self.state == StreamState::Started {
                    if id.is_some() {
                        self.id = new_response_id(self.target, id.as_deref());
                    }
                    if let (None, Some(model)) = (&self.model_override, model) {
                        self.model = model;
                    }
                }
                self.ensure_started(&mut out);
            }
            StreamEvent::TextDelta(text) => {
                if !text.is_empty() {
                    self.ensure_started(&mut out);
                    self.emit_text(&text, &mut out);
                }
            }
            StreamEvent::ReasoningDelta(text) => {
                if !text.is_empty() {
                    self.ensure_started(&mut out);
                    self.emit_reasoning(&text, &mut out);
                }
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                if self.flushed_tools.contains(&index) {
                    tracing::debug!("Ignoring delta for completed tool call {}", index);
                    return out;
                }
                let pending = self.pending_tools.entry(index).or_default();
                if pending.id.is_none() {
                    pending.id = id;
                }
                if pending.name.is_none() {
                    pending.name = name;
                }
                pending.arguments.push_str(&arguments);
                if pending.arguments.len() > self.max_tool_arguments {
                    self.pending_tools.clear();
                    let message = format!(
                        "tool call {} arguments exceeded {} bytes",
                        index, self.max_tool_arguments
                    );
                    return self.abort(&message);
                }
            }
            StreamEvent::ToolCallEnd { index } => {
                self.ensure_started(&mut out);
                self.flush_tool(index, &mut out);
            }
            StreamEvent::Usage(usage) => self.usage.merge(usage),
            StreamEvent::Finish(reason) => {
                self.finish = Some(reason);
                self.ensure_started(&mut out);
                self.flush_all_tools(&mut out);
            }
            StreamEvent::Error(message) => return self.abort(&message),
            StreamEvent::Done => out.extend(self.finish()),
        }
        out
    }

    /// Close the stream normally. Safe to call more than once.
    pub fn finish(&mut self) -> Vec<String> {
        if self.is_terminated() {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.flush_all_tools(&mut out);
        if !self.visible_emitted && self.target != WireFormat::OpenAIChat {
            self.emit_text(EMPTY_TEXT_PLACEHOLDER, &mut out);
        }
        let finish = self.finish.unwrap_or(if self.tools_emitted > 0 {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });
        match self.target {
            WireFormat::Anthropic => {
                self.close_block(&mut out);
                let mut usage = json!({
                    "input_tokens": self.usage.input.saturating_sub(self.usage.cached),
                    "output_tokens": self.usage.output,
                });
                if self.usage.cached > 0 {
                    usage["cache_read_input_tokens"] = json!(self.usage.cached);
                }
                out.push(encode_event(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": anthropic::map_finish_reason(finish.as_chat()),
                            "stop_sequence": null,
                        },
                        "usage": usage,
                    }),
                ));
                out.push(encode_event("message_stop", &json!({"type": "message_stop"})));
            }
            WireFormat::OpenAIChat => {
                let mut chunk = self.chat_chunk(json!({}), json!(finish.as_chat()));
                if !self.usage.is_empty() {
                    chunk["usage"] = json!({
                        "prompt_tokens": self.usage.input,
                        "completion_tokens": self.usage.output,
                        "total_tokens": self.usage.input + self.usage.output,
                        "prompt_tokens_details": {"cached_tokens": self.usage.cached},
                    });
                }
                out.push(encode_data(&chunk));
                out.push(DONE_FRAME.to_string());
            }
            WireFormat::OpenAIResponses => {
                self.close_item(&mut out);
                let mut response = self.response_object("completed");
                if let Some(reason) = responses::incomplete_reason(finish.as_chat()) {
                    response["status"] = json!("incomplete");
                    response["incomplete_details"] = json!({"reason": reason});
                }
                response["usage"] = responses::usage_object(
                    self.usage.input,
                    self.usage.output,
                    self.usage.cached,
                    self.usage.reasoning,
                );
                self.emit_responses(&mut out, "response.completed", json!({"response": response}));
            }
        }
        self.state = StreamState::Completed;
        out
    }

    /// Terminate with an in-band error. Safe to call more than once.
    pub fn abort(&mut self, message: &str) -> Vec<String> {
        if self.is_terminated() {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        match self.target {
            WireFormat::Anthropic => {
                self.close_block(&mut out);
                out.push(encode_event(
                    "error",
                    &json!({"type": "error", "error": {"type": "api_error", "message": message}}),
                ));
                out.push(encode_event("message_stop", &json!({"type": "message_stop"})));
            }
            WireFormat::OpenAIChat => {
                out.push(encode_data(
                    &json!({"error": {"message": message, "type": "upstream_error"}}),
                ));
                out.push(DONE_FRAME.to_string());
            }
            WireFormat::OpenAIResponses => {
                self.close_item(&mut out);
                self.emit_responses(
                    &mut out,
                    "error",
                    json!({"code": "upstream_error", "message": message}),
                );
                let mut response = self.response_object("failed");
                response["error"] = json!({"code": "server_error", "message": message});
                self.emit_responses(&mut out, "response.failed", json!({"response": response}));
            }
        }
        self.state = StreamState::Aborted;
        out
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.state != StreamState::Started {
            return;
        }
        self.state = StreamState::Streaming;
        match self.target {
            WireFormat::Anthropic => {
                let mut usage = json!({
                    "input_tokens": self.usage.input.saturating_sub(self.usage.cached),
                    "output_tokens": 0,
                });
                if self.usage.cached > 0 {
                    usage["cache_read_input_tokens"] = json!(self.usage.cached);
                }
                out.push(encode_event(
                    "message_start",
                    &json!({
                        "type": "message_start",
                        "message": {
                            "id": self.id,
                            "type": "message",
                            "role": "assistant",
                            "model": self.model,
                            "content": [],
                            "stop_reason": null,
                            "stop_sequence": null,
                            "usage": usage,
                        }
                    }),
                ));
            }
            WireFormat::OpenAIChat => {
                let chunk = self.chat_chunk(json!({"role": "assistant", "content": ""}), Value::Null);
                out.push(encode_data(&chunk));
            }
            WireFormat::OpenAIResponses => {
                let response = self.response_object("in_progress");
                self.emit_responses(out, "response.created", json!({"response": response.clone()}));
                self.emit_responses(out, "response.in_progress", json!({"response": response}));
            }
        }
    }

    fn emit_text(&mut self, text: &str, out: &mut Vec<String>) {
        self.visible_emitted = true;
        match self.target {
            WireFormat::Anthropic => {
                self.open_anthropic_block(BlockKind::Text, out);
                out.push(encode_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
            WireFormat::OpenAIChat => {
                let chunk = self.chat_chunk(json!({"content": text}), Value::Null);
                out.push(encode_data(&chunk));
            }
            WireFormat::OpenAIResponses => {
                if !matches!(self.open_item, Some(OpenItem::Message { .. })) {
                    self.close_item(out);
                    let id = short_id("msg");
                    self.emit_responses(
                        out,
                        "response.output_item.added",
                        json!({
                            "output_index": self.output_index,
                            "item": {"id": id, "type": "message", "status": "in_progress", "role": "assistant", "content": []},
                        }),
                    );
                    self.emit_responses(
                        out,
                        "response.content_part.added",
                        json!({
                            "item_id": id,
                            "output_index": self.output_index,
                            "content_index": 0,
                            "part": {"type": "output_text", "text": "", "annotations": []},
                        }),
                    );
                    self.open_item = Some(OpenItem::Message {
                        id,
                        text: String::new(),
                    });
                }
                let item_id = match &mut self.open_item {
                    Some(OpenItem::Message { id, text: buffer }) => {
                        buffer.push_str(text);
                        id.clone()
                    }
                    _ => return,
                };
                self.emit_responses(
                    out,
                    "response.output_text.delta",
                    json!({
                        "item_id": item_id,
                        "output_index": self.output_index,
                        "content_index": 0,
                        "delta": text,
                    }),
                );
            }
        }
    }

    fn emit_reasoning(&mut self, text: &str, out: &mut Vec<String>) {
        match self.target {
            WireFormat::Anthropic => {
                self.open_anthropic_block(BlockKind::Thinking, out);
                out.push(encode_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "thinking_delta", "thinking": text},
                    }),
                ));
            }
            WireFormat::OpenAIChat => {
                let chunk = self.chat_chunk(json!({"reasoning_content": text}), Value::Null);
                out.push(encode_data(&chunk));
            }
            WireFormat::OpenAIResponses => {
                if !matches!(self.open_item, Some(OpenItem::Reasoning { .. })) {
                    self.close_item(out);
                    let id = short_id("rs");
                    self.emit_responses(
                        out,
                        "response.output_item.added",
                        json!({
                            "output_index": self.output_index,
                            "item": {"id": id, "type": "reasoning", "summary": []},
                        }),
                    );
                    self.emit_responses(
                        out,
                        "response.reasoning_summary_part.added",
                        json!({
                            "item_id": id,
                            "output_index": self.output_index,
                            "summary_index": 0,
                            "part": {"type": "summary_text", "text": ""},
                        }),
                    );
                    self.open_item = Some(OpenItem::Reasoning {
                        id,
                        text: String::new(),
                    });
                }
                let item_id = match &mut self.open_item {
                    Some(OpenItem::Reasoning { id, text: buffer }) => {
                        buffer.push_str(text);
                        id.clone()
                    }
                    _ => return,
                };
                self.emit_responses(
                    out,
                    "response.reasoning_summary_text.delta",
                    json!({
                        "item_id": item_id,
                        "output_index": self.output_index,
                        "summary_index": 0,
                        "delta": text,
                    }),
                );
            }
        }
    }

    fn flush_all_tools(&mut self, out: &mut Vec<String>) {
        let indices: Vec<usize> = self.pending_tools.keys().copied().collect();
        for index in indices {
            self.flush_tool(index, out);
        }
    }

    fn flush_tool(&mut self, index: usize, out: &mut Vec<String>) {
        let Some(call) = self.pending_tools.remove(&index) else {
            return;
        };
        self.flushed_tools.insert(index);
        let Some(name) = call.name.filter(|n| !n.is_empty()) else {
            tracing::warn!("Dropping tool call {} without a name", index);
            return;
        };
        let arguments = if call.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            call.arguments
        };
        self.visible_emitted = true;
        self.tools_emitted += 1;

        match self.target {
            WireFormat::Anthropic => {
                let id = call.id.unwrap_or_else(|| short_id("toolu"));
                self.close_block(out);
                out.push(encode_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    }),
                ));
                out.push(encode_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "input_json_delta", "partial_json": arguments},
                    }),
                ));
                out.push(encode_event(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": self.block_index}),
                ));
                self.block_index += 1;
            }
            WireFormat::OpenAIChat => {
                let id = call.id.unwrap_or_else(|| short_id("call"));
                let delta = json!({
                    "tool_calls": [{
                        "index": self.tools_emitted - 1,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments},
                    }]
                });
                let chunk = self.chat_chunk(delta, Value::Null);
                out.push(encode_data(&chunk));
            }
            WireFormat::OpenAIResponses => {
                self.close_item(out);
                let call_id = call.id.unwrap_or_else(|| short_id("call"));
                let item_id = short_id("fc");
                self.emit_responses(
                    out,
                    "response.output_item.added",
                    json!({
                        "output_index": self.output_index,
                        "item": {
                            "id": item_id,
                            "type": "function_call",
                            "status": "in_progress",
                            "call_id": call_id,
                            "name": name,
                            "arguments": "",
                        },
                    }),
                );
                self.emit_responses(
                    out,
                    "response.function_call_arguments.delta",
                    json!({"item_id": item_id, "output_index": self.output_index, "delta": arguments}),
                );
                self.emit_responses(
                    out,
                    "response.function_call_arguments.done",
                    json!({"item_id": item_id, "output_index": self.output_index, "arguments": arguments}),
                );
                let item = responses::function_call_item(&item_id, &call_id, &name, &arguments);
                self.emit_responses(
                    out,
                    "response.output_item.done",
                    json!({"output_index": self.output_index, "item": item.clone()}),
                );
                self.output.push(item);
                self.output_index += 1;
            }
        }
    }

    fn open_anthropic_block(&mut self, kind: BlockKind, out: &mut Vec<String>) {
        if self.open_block == Some(kind) {
            return;
        }
        self.close_block(out);
        let content_block = match kind {
            BlockKind::Text => json!({"type": "text", "text": ""}),
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
        };
        out.push(encode_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block,
            }),
        ));
        self.open_block = Some(kind);
    }

    fn close_block(&mut self, out: &mut Vec<String>) {
        if self.open_block.take().is_some() {
            out.push(encode_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": self.block_index}),
            ));
            self.block_index += 1;
        }
    }

    fn close_item(&mut self, out: &mut Vec<String>) {
        let Some(item) = self.open_item.take() else {
            return;
        };
        let output_index = self.output_index;
        let done = match item {
            OpenItem::Message { id, text } => {
                self.emit_responses(
                    out,
                    "response.output_text.done",
                    json!({"item_id": id, "output_index": output_index, "content_index": 0, "text": text}),
                );
                self.emit_responses(
                    out,
                    "response.content_part.done",
                    json!({
                        "item_id": id,
                        "output_index": output_index,
                        "content_index": 0,
                        "part": {"type": "output_text", "text": text, "annotations": []},
                    }),
                );
                responses::message_item(&id, &text)
            }
            OpenItem::Reasoning { id, text } => {
                self.emit_responses(
                    out,
                    "response.reasoning_summary_text.done",
                    json!({"item_id": id, "output_index": output_index, "summary_index": 0, "text": text}),
                );
                self.emit_responses(
                    out,
                    "response.reasoning_summary_part.done",
                    json!({
                        "item_id": id,
                        "output_index": output_index,
                        "summary_index": 0,
                        "part": {"type": "summary_text", "text": text},
                    }),
                );
                responses::reasoning_item(&id, &text)
            }
        };
        self.emit_responses(
            out,
            "response.output_item.done",
            json!({"output_index": output_index, "item": done.clone()}),
        );
        self.output.push(done);
        self.output_index += 1;
    }

    fn chat_chunk(&self, delta: Value, finish_reason: Value) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    }

    fn response_object(&self, status: &str) -> Value {
        json!({
            "id": self.id,
            "object": "response",
            "created_at": self.created,
            "status": status,
            "model": self.model,
            "output": self.output,
            "incomplete_details": null,
            "error": null,
        })
    }

    fn emit_responses(&mut self, out: &mut Vec<String>, event: &str, data: Value) {
        let mut payload = Map::new();
        payload.insert("type".to_string(), json!(event));
        payload.insert("sequence_number".to_string(), json!(self.sequence));
        if let Value::Object(fields) = data {
            payload.extend(fields);
        }
        self.sequence += 1;
        out.push(encode_event(event, &Value::Object(payload)));
    }
}

fn new_response_id(target: WireFormat, upstream: Option<&str>) -> String {
    let prefix = match target {
        WireFormat::Anthropic => "msg_",
        WireFormat::OpenAIChat => "chatcmpl-",
        WireFormat::OpenAIResponses => "resp_",
    };
    let suffix = upstream
        .map(|id| {
            id.trim_start_matches("msg_")
                .trim_start_matches("chatcmpl-")
                .trim_start_matches("resp_")
        })
        .filter(|s| !s.is_empty());
    match suffix {
        Some(suffix) => format!("{}{}", prefix, suffix),
        None => format!("{}{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..24]),
    }
}

/// Folds stream events into one Chat completion, for clients that asked
/// for JSON when the upstream streamed anyway.
#[derive(Debug, Default)]
pub struct StreamCollector {
    id: Option<String>,
    model: Option<String>,
    text: String,
    reasoning: String,
    tools: BTreeMap<usize, PendingToolCall>,
    usage: Usage,
    finish: Option<FinishReason>,
    error: Option<String>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Start { id, model } => {
                self.id = self.id.take().or(id);
                self.model = self.model.take().or(model);
            }
            StreamEvent::TextDelta(text) => self.text.push_str(&text),
            StreamEvent::ReasoningDelta(text) => self.reasoning.push_str(&text),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.tools.entry(index).or_default();
                if call.id.is_none() {
                    call.id = id;
                }
                if call.name.is_none() {
                    call.name = name;
                }
                call.arguments.push_str(&arguments);
            }
            StreamEvent::Usage(usage) => self.usage.merge(usage),
            StreamEvent::Finish(reason) => self.finish = Some(reason),
            StreamEvent::Error(message) => self.error = Some(message),
            StreamEvent::ToolCallEnd { .. } | StreamEvent::Done => {}
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_chat_completion(self, model_override: Option<&str>) -> Value {
        let tool_calls: Vec<Value> = self
            .tools
            .into_values()
            .filter_map(|call| {
                let name = call.name.filter(|n| !n.is_empty())?;
                let arguments = if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                };
                Some(json!({
                    "id": call.id.unwrap_or_else(|| short_id("call")),
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                }))
            })
            .collect();

        let finish = self.finish.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        let mut message = json!({"role": "assistant", "content": self.text});
        if !self.reasoning.is_empty() {
            message["reasoning_content"] = json!(self.reasoning);
        }
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }
        let model = model_override.map(str::to_string).or(self.model);
        json!({
            "id": new_response_id(WireFormat::OpenAIChat, self.id.as_deref()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{"index": 0, "message": message, "finish_reason": finish.as_chat()}],
            "usage": {
                "prompt_tokens": self.usage.input,
                "completion_tokens": self.usage.output,
                "total_tokens": self.usage.input + self.usage.output,
                "prompt_tokens_details": {"cached_tokens": self.usage.cached},
                "completion_tokens_details": {"reasoning_tokens": self.usage.reasoning},
            }
        })
    }
}

/// Replay a Chat completion as stream events.
pub fn events_from_chat(chat: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(usage) = chat.get("usage").filter(|u| u.is_object()) {
        events.push(StreamEvent::Usage(Usage {
            input: u64_at(usage, "/prompt_tokens"),
            output: u64_at(usage, "/completion_tokens"),
            cached: u64_at(usage, "/prompt_tokens_details/cached_tokens"),
            reasoning: u64_at(usage, "/completion_tokens_details/reasoning_tokens"),
        }));
    }
    events.push(StreamEvent::Start {
        id: str_field(chat, "id").map(str::to_string),
        model: str_field(chat, "model").map(str::to_string),
    });

    let choice = chat.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first());
    if let Some(message) = choice.and_then(|c| c.get("message")) {
        let reasoning = str_field(message, "reasoning_content").or_else(|| str_field(message, "reasoning"));
        if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::ReasoningDelta(text.to_string()));
        }
        let text = match message.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts.iter().filter_map(|p| str_field(p, "text")).collect(),
            _ => String::new(),
        };
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta(text));
        }
        if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            for (index, call) in calls.iter().enumerate() {
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    id: str_field(call, "id").map(str::to_string),
                    name: call.pointer("/function/name").and_then(|v| v.as_str()).map(str::to_string),
                    arguments: call
                        .pointer("/function/arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                });
                events.push(StreamEvent::ToolCallEnd { index });
            }
        }
    }
    if let Some(reason) = choice.and_then(|c| str_field(c, "finish_reason")) {
        events.push(StreamEvent::Finish(FinishReason::from_chat(reason)));
    }
    events.push(StreamEvent::Done);
    events
}

/// Build a complete client SSE stream from a non-streaming upstream body.
/// Conversion happens before any frame exists, so a failure leaves nothing
/// half-sent.
pub fn synthesize_stream(
    upstream_body: &Value,
    upstream: WireFormat,
    client: WireFormat,
    model_override: Option<String>,
) -> Result<Vec<String>, ConversionError> {
    let chat = ConversionDescriptor::new(client, upstream, true).response_to_chat(upstream_body)?;
    let mut accumulator = StreamAccumulator::new(client, model_override);
    let mut frames = Vec::new();
    for event in events_from_chat(&chat) {
        frames.extend(accumulator.push(event));
    }
    frames.extend(accumulator.finish());
    Ok(frames)
}

/// Terminal error frames for a stream that was forwarded unchanged, so no
/// accumulator knows its state.
pub fn error_frames(format: WireFormat, message: &str) -> Vec<String> {
    match format {
        WireFormat::Anthropic => vec![
            encode_event(
                "error",
                &json!({"type": "error", "error": {"type": "api_error", "message": message}}),
            ),
            encode_event("message_stop", &json!({"type": "message_stop"})),
        ],
        WireFormat::OpenAIChat => vec![
            encode_data(&json!({"error": {"message": message, "type": "upstream_error"}})),
            DONE_FRAME.to_string(),
        ],
        WireFormat::OpenAIResponses => vec![
            encode_event(
                "error",
                &json!({"type": "error", "code": "upstream_error", "message": message}),
            ),
            encode_event(
                "response.failed",
                &json!({
                    "type": "response.failed",
                    "response": {
                        "status": "failed",
                        "error": {"code": "server_error", "message": message},
                    },
                }),
            ),
        ],
    }
}
