// Anthropic Messages <-> OpenAI Chat Completions

use serde_json::{json, Map, Value};

use super::{json_to_string, short_id, str_field, EMPTY_TEXT_PLACEHOLDER};
use crate::error::ConversionError;

/// Anthropic requires `max_tokens`; Chat does not.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Anthropic `stop_reason` -> Chat `finish_reason`.
pub fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        _ => "stop",
    }
}

/// Chat `finish_reason` -> Anthropic `stop_reason`.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "refusal",
        _ => "end_turn",
    }
}

fn budget_to_effort(budget: i64) -> &'static str {
    match budget {
        i64::MIN..=1024 => "low",
        1025..=8192 => "medium",
        _ => "high",
    }
}

fn effort_to_budget(effort: &str) -> Option<u64> {
    match effort {
        "minimal" | "low" => Some(1024),
        "medium" => Some(8192),
        "high" => Some(24576),
        "xhigh" => Some(32768),
        _ => None,
    }
}

/// Text of an Anthropic `system` value (string or list of text blocks).
fn system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| str_field(b, "text"))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

fn image_block_to_url(block: &Value) -> Option<String> {
    let source = block.get("source")?;
    match str_field(source, "type") {
        Some("url") => str_field(source, "url").map(str::to_string),
        _ => {
            let data = str_field(source, "data").filter(|d| !d.is_empty())?;
            let media_type = str_field(source, "media_type").unwrap_or("image/png");
            Some(format!("data:{};base64,{}", media_type, data))
        }
    }
}

fn url_to_image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            });
        }
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|item| match str_field(item, "text") {
                    Some(text) => text.to_string(),
                    None => json_to_string(item),
                })
                .collect();
            parts.join("\n\n")
        }
        Value::Object(_) => str_field(content, "text")
            .map(str::to_string)
            .unwrap_or_else(|| content.to_string()),
        other => json_to_string(other),
    }
}

/// Chat content parts collapse to a plain string when they are all text.
fn collapse_parts(parts: Vec<Value>) -> Value {
    if parts.iter().all(|p| str_field(p, "type") == Some("text")) {
        let texts: Vec<&str> = parts.iter().filter_map(|p| str_field(p, "text")).collect();
        json!(texts.join("\n\n"))
    } else {
        Value::Array(parts)
    }
}

pub fn request_to_chat(req: &Value) -> Result<Value, ConversionError> {
    let messages = req
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ConversionError::missing("messages"))?;

    let mut out = Map::new();
    for key in ["model", "max_tokens", "temperature", "top_p", "stream"] {
        if let Some(value) = req.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(stops) = req.get("stop_sequences").and_then(|v| v.as_array()) {
        if !stops.is_empty() {
            out.insert("stop".to_string(), Value::Array(stops.clone()));
        }
    }
    if let Some(user) = req.pointer("/metadata/user_id") {
        out.insert("user".to_string(), user.clone());
    }
    if let Some(thinking) = req.get("thinking") {
        if str_field(thinking, "type") == Some("enabled") {
            let budget = thinking.get("budget_tokens").and_then(|v| v.as_i64()).unwrap_or(8192);
            out.insert("reasoning_effort".to_string(), json!(budget_to_effort(budget)));
        }
    }

    let mut chat_messages: Vec<Value> = Vec::new();
    if let Some(system) = req.get("system") {
        let text = system_text(system);
        if !text.is_empty() {
            chat_messages.push(json!({"role": "system", "content": text}));
        }
    }

    for (i, msg) in messages.iter().enumerate() {
        let role = str_field(msg, "role")
            .ok_or_else(|| ConversionError::missing(format!("messages[{}].role", i)))?;
        match msg.get("content") {
            Some(Value::String(text)) => {
                chat_messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => convert_blocks(role, blocks, &mut chat_messages),
            _ => return Err(ConversionError::missing(format!("messages[{}].content", i))),
        }
    }
    out.insert("messages".to_string(), Value::Array(chat_messages));

    if let Some(tools) = req.get("tools").and_then(|v| v.as_array()) {
        let defs: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let name = str_field(tool, "name").filter(|n| !n.is_empty())?;
                let declared = str_field(tool, "type");
                // Server-side tools (web search and friends) have no schema.
                if tool.get("input_schema").is_none() && declared.is_some() && declared != Some("custom") {
                    return None;
                }
                let mut function = json!({
                    "name": name,
                    "parameters": tool
                        .get("input_schema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                });
                if let Some(description) = tool.get("description") {
                    function["description"] = description.clone();
                }
                Some(json!({"type": "function", "function": function}))
            })
            .collect();
        if !defs.is_empty() {
            out.insert("tools".to_string(), Value::Array(defs));
        }
    }

    if let Some(choice) = req.get("tool_choice") {
        let mapped = match str_field(choice, "type") {
            Some("any") => Some(json!("required")),
            Some("none") => Some(json!("none")),
            Some("tool") => str_field(choice, "name")
                .map(|name| json!({"type": "function", "function": {"name": name}})),
            Some("auto") => Some(json!("auto")),
            _ => None,
        };
        if let Some(mapped) = mapped {
            out.insert("tool_choice".to_string(), mapped);
        }
        if choice.get("disable_parallel_tool_use").and_then(|v| v.as_bool()) == Some(true) {
            out.insert("parallel_tool_calls".to_string(), json!(false));
        }
    }

    Ok(Value::Object(out))
}

fn convert_blocks(role: &str, blocks: &[Value], out: &mut Vec<Value>) {
    let mut parts: Vec<Value> = Vec::new();
    let mut reasoning: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match str_field(block, "type").unwrap_or("") {
            "text" => {
                let text = str_field(block, "text").unwrap_or("");
                if !text.is_empty() {
                    parts.push(json!({"type": "text", "text": text}));
                }
            }
            "image" => {
                if let Some(url) = image_block_to_url(block) {
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
            "thinking" if role == "assistant" => {
                if let Some(text) = str_field(block, "thinking").filter(|t| !t.trim().is_empty()) {
                    reasoning.push(text);
                }
            }
            "tool_use" if role == "assistant" => {
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(json!({
                    "id": str_field(block, "id").unwrap_or(""),
                    "type": "function",
                    "function": {
                        "name": str_field(block, "name").unwrap_or(""),
                        "arguments": input.to_string(),
                    }
                }));
            }
            "tool_result" => {
                // Tool results become their own messages, ahead of any text.
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": str_field(block, "tool_use_id").unwrap_or(""),
                    "content": tool_result_text(block.get("content").unwrap_or(&Value::Null)),
                }));
            }
            _ => {}
        }
    }

    if role == "assistant" {
        if parts.is_empty() && reasoning.is_empty() && tool_calls.is_empty() {
            return;
        }
        let mut msg = Map::new();
        msg.insert("role".to_string(), json!("assistant"));
        let content = if parts.is_empty() {
            json!("")
        } else {
            collapse_parts(parts)
        };
        msg.insert("content".to_string(), content);
        if !reasoning.is_empty() {
            msg.insert("reasoning_content".to_string(), json!(reasoning.join("\n\n")));
        }
        if !tool_calls.is_empty() {
            msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        out.push(Value::Object(msg));
    } else if !parts.is_empty() {
        out.push(json!({"role": role, "content": collapse_parts(parts)}));
    }
}

/// Anthropic message content while it is being assembled.
enum Content {
    Text(String),
    Blocks(Vec<Value>),
}

impl Content {
    fn is_empty(&self) -> bool {
        match self {
            Content::Text(t) => t.is_empty(),
            Content::Blocks(b) => b.is_empty(),
        }
    }

    fn into_blocks(self) -> Vec<Value> {
        match self {
            Content::Text(t) if t.is_empty() => Vec::new(),
            Content::Text(t) => vec![json!({"type": "text", "text": t})],
            Content::Blocks(b) => b,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Content::Text(t) => Value::String(t),
            Content::Blocks(b) => Value::Array(b),
        }
    }
}

/// Append, merging into the previous message when the role repeats;
/// Anthropic requires strict user/assistant alternation.
fn push_message(messages: &mut Vec<(String, Content)>, role: &str, content: Content) {
    if content.is_empty() {
        return;
    }
    if let Some((last_role, last)) = messages.last_mut() {
        if last_role == role {
            let previous = std::mem::replace(last, Content::Blocks(Vec::new()));
            let mut blocks = previous.into_blocks();
            blocks.extend(content.into_blocks());
            if role == "user" {
                // tool_result blocks must lead the user turn.
                blocks.sort_by_key(|b| str_field(b, "type") != Some("tool_result"));
            }
            *last = Content::Blocks(blocks);
            return;
        }
    }
    messages.push((role.to_string(), content));
}

fn chat_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| str_field(p, "text"))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

fn chat_content_to_anthropic(content: Option<&Value>) -> Content {
    match content {
        Some(Value::String(s)) => Content::Text(s.clone()),
        Some(Value::Array(parts)) => {
            let blocks = parts
                .iter()
                .filter_map(|part| match str_field(part, "type") {
                    Some("text") | Some("input_text") | Some("output_text") => {
                        str_field(part, "text")
                            .filter(|t| !t.is_empty())
                            .map(|t| json!({"type": "text", "text": t}))
                    }
                    Some("image_url") => {
                        let url = part
                            .pointer("/image_url/url")
                            .or_else(|| part.get("image_url"))
                            .and_then(|v| v.as_str())?;
                        Some(url_to_image_block(url))
                    }
                    _ => None,
                })
                .collect();
            Content::Blocks(blocks)
        }
        _ => Content::Text(String::new()),
    }
}

fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::String(s) if s.trim().is_empty() => json!({}),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(|v| v.is_object())
            .unwrap_or_else(|| {
                tracing::debug!("Tool arguments are not a JSON object, sending empty input");
                json!({})
            }),
        Value::Object(_) => raw.clone(),
        _ => json!({}),
    }
}

pub fn request_from_chat(req: &Value) -> Result<Value, ConversionError> {
    let messages = req
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ConversionError::missing("messages"))?;

    let mut out = Map::new();
    if let Some(model) = req.get("model") {
        out.insert("model".to_string(), model.clone());
    }
    let mut max_tokens = req
        .get("max_tokens")
        .or_else(|| req.get("max_completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_MAX_TOKENS);
    for key in ["temperature", "top_p", "stream"] {
        if let Some(value) = req.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    match req.get("stop") {
        Some(Value::String(s)) => {
            out.insert("stop_sequences".to_string(), json!([s]));
        }
        Some(Value::Array(stops)) if !stops.is_empty() => {
            out.insert("stop_sequences".to_string(), Value::Array(stops.clone()));
        }
        _ => {}
    }
    if let Some(user) = req.get("user").and_then(|v| v.as_str()) {
        out.insert("metadata".to_string(), json!({"user_id": user}));
    }
    if let Some(budget) = str_field(req, "reasoning_effort").and_then(effort_to_budget) {
        if max_tokens <= budget {
            max_tokens = budget + DEFAULT_MAX_TOKENS;
        }
        out.insert("thinking".to_string(), json!({"type": "enabled", "budget_tokens": budget}));
        out.remove("temperature");
        out.remove("top_p");
    }
    out.insert("max_tokens".to_string(), json!(max_tokens));

    let mut system_parts: Vec<String> = Vec::new();
    let mut assembled: Vec<(String, Content)> = Vec::new();

    for (i, msg) in messages.iter().enumerate() {
        let role = str_field(msg, "role")
            .ok_or_else(|| ConversionError::missing(format!("messages[{}].role", i)))?;
        match role {
            "system" | "developer" => {
                let text = chat_text(msg.get("content"));
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => push_message(&mut assembled, "user", chat_content_to_anthropic(msg.get("content"))),
            "assistant" => {
                let mut blocks = chat_content_to_anthropic(msg.get("content")).into_blocks();
                if let Some(calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
                    for (j, call) in calls.iter().enumerate() {
                        let name = call
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .filter(|n| !n.is_empty())
                            .ok_or_else(|| {
                                ConversionError::missing(format!(
                                    "messages[{}].tool_calls[{}].function.name",
                                    i, j
                                ))
                            })?;
                        let id = str_field(call, "id")
                            .filter(|id| !id.is_empty())
                            .map(str::to_string)
                            .unwrap_or_else(|| short_id("toolu"));
                        let input = parse_arguments(call.pointer("/function/arguments").unwrap_or(&Value::Null));
                        blocks.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
                    }
                }
                push_message(&mut assembled, "assistant", Content::Blocks(blocks));
            }
            "tool" | "function" => {
                let tool_use_id = str_field(msg, "tool_call_id")
                    .or_else(|| str_field(msg, "name"))
                    .ok_or_else(|| ConversionError::missing(format!("messages[{}].tool_call_id", i)))?;
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": chat_text(msg.get("content")),
                });
                push_message(&mut assembled, "user", Content::Blocks(vec![block]));
            }
            other => {
                return Err(ConversionError::invalid(
                    format!("messages[{}].role", i),
                    format!("unknown role `{}`", other),
                ))
            }
        }
    }

    if !system_parts.is_empty() {
        out.insert("system".to_string(), json!(system_parts.join("\n\n")));
    }
    let messages: Vec<Value> = assembled
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content.into_value()}))
        .collect();
    out.insert("messages".to_string(), Value::Array(messages));

    let mut has_tools = false;
    if let Some(tools) = req.get("tools").and_then(|v| v.as_array()) {
        let defs: Vec<Value> = tools
            .iter()
            .filter(|t| str_field(t, "type").unwrap_or("function") == "function")
            .filter_map(|t| {
                let function = t.get("function").unwrap_or(t);
                let name = str_field(function, "name")?;
                let mut def = json!({
                    "name": name,
                    "input_schema": function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                });
                if let Some(description) = function.get("description") {
                    def["description"] = description.clone();
                }
                Some(def)
            })
            .collect();
        has_tools = !defs.is_empty();
        if has_tools {
            out.insert("tools".to_string(), Value::Array(defs));
        }
    }

    let mut tool_choice = match req.get("tool_choice") {
        Some(Value::String(s)) => match s.as_str() {
            "required" | "any" => Some(json!({"type": "any"})),
            "none" => Some(json!({"type": "none"})),
            _ => Some(json!({"type": "auto"})),
        },
        Some(obj @ Value::Object(_)) => obj
            .pointer("/function/name")
            .or_else(|| obj.get("name"))
            .and_then(|v| v.as_str())
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    };
    if has_tools && req.get("parallel_tool_calls").and_then(|v| v.as_bool()) == Some(false) {
        let choice = tool_choice.get_or_insert_with(|| json!({"type": "auto"}));
        choice["disable_parallel_tool_use"] = json!(true);
    }
    if has_tools {
        if let Some(choice) = tool_choice {
            out.insert("tool_choice".to_string(), choice);
        }
    }

    Ok(Value::Object(out))
}

pub fn response_to_chat(resp: &Value) -> Result<Value, ConversionError> {
    let content = resp
        .get("content")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ConversionError::missing("content"))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for block in content {
        match str_field(block, "type").unwrap_or("") {
            "text" => text.push_str(str_field(block, "text").unwrap_or("")),
            "thinking" => reasoning.push_str(str_field(block, "thinking").unwrap_or("")),
            "tool_use" => tool_calls.push(json!({
                "id": str_field(block, "id").unwrap_or(""),
                "type": "function",
                "function": {
                    "name": str_field(block, "name").unwrap_or(""),
                    "arguments": block.get("input").cloned().unwrap_or_else(|| json!({})).to_string(),
                }
            })),
            _ => {}
        }
    }

    let finish_reason = match str_field(resp, "stop_reason") {
        Some(reason) => map_stop_reason(reason),
        None if !tool_calls.is_empty() => "tool_calls",
        None => "stop",
    };

    let mut message = json!({"role": "assistant", "content": text});
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let usage = resp.get("usage");
    let field = |key: &str| usage.and_then(|u| u.get(key)).and_then(|v| v.as_u64()).unwrap_or(0);
    let cached = field("cache_read_input_tokens");
    let prompt = field("input_tokens") + cached + field("cache_creation_input_tokens");
    let completion = field("output_tokens");

    let id = str_field(resp, "id").unwrap_or("");
    Ok(json!({
        "id": format!("chatcmpl-{}", id.trim_start_matches("msg_")),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": resp.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
            "prompt_tokens_details": {"cached_tokens": cached},
        }
    }))
}

fn chat_tool_call_to_block(call: &Value) -> Option<Value> {
    let id = str_field(call, "id").unwrap_or("");
    let name = call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or("");
    if id.is_empty() && name.is_empty() {
        return None;
    }
    let id = if id.is_empty() {
        short_id("toolu")
    } else {
        id.to_string()
    };
    Some(json!({
        "type": "tool_use",
        "id": id,
        "name": name,
        "input": parse_arguments(call.pointer("/function/arguments").unwrap_or(&Value::Null)),
    }))
}

pub fn response_from_chat(resp: &Value) -> Result<Value, ConversionError> {
    let choice = resp
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .ok_or_else(|| ConversionError::missing("choices"))?;
    let empty = json!({});
    let message = choice.get("message").unwrap_or(&empty);

    let mut blocks: Vec<Value> = Vec::new();
    let reasoning = str_field(message, "reasoning_content").or_else(|| str_field(message, "reasoning"));
    if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
        blocks.push(json!({"type": "thinking", "thinking": reasoning, "signature": ""}));
    }

    match message.get("content") {
        Some(Value::String(text)) if !text.is_empty() => {
            blocks.push(json!({"type": "text", "text": text}));
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(text) = str_field(part, "text").filter(|t| !t.is_empty()) {
                    blocks.push(json!({"type": "text", "text": text}));
                }
            }
        }
        _ => {}
    }

    let mut has_tool_use = false;
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            if let Some(block) = chat_tool_call_to_block(call) {
                has_tool_use = true;
                blocks.push(block);
            }
        }
    }

    let has_text = blocks.iter().any(|b| str_field(b, "type") == Some("text"));
    if !has_text && !has_tool_use {
        blocks.push(json!({"type": "text", "text": EMPTY_TEXT_PLACEHOLDER}));
    }

    let stop_reason = match str_field(choice, "finish_reason") {
        Some(reason) => map_finish_reason(reason),
        None if has_tool_use => "tool_use",
        None => "end_turn",
    };

    let usage = resp.get("usage");
    let prompt = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let cached = usage
        .and_then(|u| u.pointer("/prompt_tokens_details/cached_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let mut usage_out = json!({
        "input_tokens": prompt.saturating_sub(cached),
        "output_tokens": completion,
    });
    if cached > 0 {
        usage_out["cache_read_input_tokens"] = json!(cached);
    }

    let id = match str_field(resp, "id").filter(|id| !id.is_empty()) {
        Some(id) => format!("msg_{}", id.trim_start_matches("chatcmpl-")),
        None => short_id("msg"),
    };

    Ok(json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": resp.get("model").cloned().unwrap_or(Value::Null),
        "content": blocks,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": usage_out,
    }))
}
