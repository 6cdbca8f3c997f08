// OpenAI Responses <-> OpenAI Chat Completions

use serde_json::{json, Map, Value};

use super::{json_to_string, short_id, str_field, EMPTY_TEXT_PLACEHOLDER};
use crate::error::ConversionError;

/// Responses `usage` object.
pub(crate) fn usage_object(input: u64, output: u64, cached: u64, reasoning: u64) -> Value {
    json!({
        "input_tokens": input,
        "input_tokens_details": {"cached_tokens": cached},
        "output_tokens": output,
        "output_tokens_details": {"reasoning_tokens": reasoning},
        "total_tokens": input + output,
    })
}

/// Responses `incomplete_details.reason` for a Chat finish reason, if the
/// response did not complete normally.
pub(crate) fn incomplete_reason(finish_reason: &str) -> Option<&'static str> {
    match finish_reason {
        "length" => Some("max_output_tokens"),
        "content_filter" => Some("content_filter"),
        _ => None,
    }
}

fn parts_text(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| str_field(p, "text").or_else(|| str_field(p, "refusal")))
        .collect::<Vec<_>>()
        .join("")
}

/// Responses message content -> Chat message content.
fn message_content_to_chat(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => json!(s),
        Some(Value::Array(parts)) => {
            let has_image = parts.iter().any(|p| str_field(p, "type") == Some("input_image"));
            if !has_image {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| str_field(p, "text").or_else(|| str_field(p, "refusal")))
                    .collect();
                return json!(texts.join("\n\n"));
            }
            let converted: Vec<Value> = parts
                .iter()
                .filter_map(|part| match str_field(part, "type") {
                    Some("input_image") => {
                        let url = part
                            .get("image_url")
                            .and_then(|v| v.as_str().or_else(|| v.get("url").and_then(|u| u.as_str())))?;
                        Some(json!({"type": "image_url", "image_url": {"url": url}}))
                    }
                    _ => str_field(part, "text").map(|t| json!({"type": "text", "text": t})),
                })
                .collect();
            Value::Array(converted)
        }
        _ => json!(""),
    }
}

pub fn request_to_chat(req: &Value) -> Result<Value, ConversionError> {
    let input = req.get("input").ok_or_else(|| ConversionError::missing("input"))?;

    let mut messages: Vec<Value> = Vec::new();
    if let Some(instructions) = str_field(req, "instructions").filter(|s| !s.is_empty()) {
        messages.push(json!({"role": "system", "content": instructions}));
    }

    match input {
        Value::String(text) => messages.push(json!({"role": "user", "content": text})),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let kind = str_field(item, "type").or_else(|| item.get("role").map(|_| "message"));
                match kind {
                    Some("message") => {
                        let role = match str_field(item, "role") {
                            Some("developer") | Some("system") => "system",
                            Some(role) => role,
                            None => {
                                return Err(ConversionError::missing(format!("input[{}].role", i)))
                            }
                        };
                        messages.push(json!({
                            "role": role,
                            "content": message_content_to_chat(item.get("content")),
                        }));
                    }
                    Some("function_call") => {
                        let name = str_field(item, "name")
                            .ok_or_else(|| ConversionError::missing(format!("input[{}].name", i)))?;
                        let call_id = str_field(item, "call_id")
                            .or_else(|| str_field(item, "id"))
                            .unwrap_or("");
                        let call = json!({
                            "id": call_id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": json_to_string(item.get("arguments").unwrap_or(&Value::Null)),
                            }
                        });
                        attach_tool_call(&mut messages, call);
                    }
                    Some("function_call_output") => {
                        let call_id = str_field(item, "call_id")
                            .ok_or_else(|| ConversionError::missing(format!("input[{}].call_id", i)))?;
                        let output = match item.get("output") {
                            Some(Value::Array(parts)) => parts_text(parts),
                            Some(other) => json_to_string(other),
                            None => String::new(),
                        };
                        messages.push(json!({"role": "tool", "tool_call_id": call_id, "content": output}));
                    }
                    // Reasoning items and hosted-tool calls have no Chat form.
                    _ => {}
                }
            }
        }
        _ => return Err(ConversionError::invalid("input", "expected a string or an array")),
    }

    let mut out = Map::new();
    for key in ["model", "temperature", "top_p", "stream", "user", "parallel_tool_calls"] {
        if let Some(value) = req.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));
    if let Some(max) = req.get("max_output_tokens") {
        out.insert("max_tokens".to_string(), max.clone());
    }
    if let Some(effort) = req.pointer("/reasoning/effort") {
        out.insert("reasoning_effort".to_string(), effort.clone());
    }

    if let Some(tools) = req.get("tools").and_then(|v| v.as_array()) {
        let defs: Vec<Value> = tools
            .iter()
            .filter(|t| str_field(t, "type") == Some("function"))
            .filter_map(|t| {
                let name = str_field(t, "name")?;
                let mut function = json!({
                    "name": name,
                    "parameters": t
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                });
                for key in ["description", "strict"] {
                    if let Some(value) = t.get(key) {
                        function[key] = value.clone();
                    }
                }
                Some(json!({"type": "function", "function": function}))
            })
            .collect();
        if !defs.is_empty() {
            out.insert("tools".to_string(), Value::Array(defs));
        }
    }

    match req.get("tool_choice") {
        Some(Value::String(choice)) => {
            let mapped = if choice == "any" { "required" } else { choice.as_str() };
            out.insert("tool_choice".to_string(), json!(mapped));
        }
        Some(choice @ Value::Object(_)) => {
            if let Some(name) = str_field(choice, "name") {
                out.insert(
                    "tool_choice".to_string(),
                    json!({"type": "function", "function": {"name": name}}),
                );
            }
        }
        _ => {}
    }

    if let Some(format) = req.pointer("/text/format") {
        match str_field(format, "type") {
            Some("json_schema") => {
                let mut schema = json!({
                    "name": str_field(format, "name").unwrap_or("response"),
                    "schema": format.get("schema").cloned().unwrap_or_else(|| json!({})),
                });
                if let Some(strict) = format.get("strict") {
                    schema["strict"] = strict.clone();
                }
                out.insert(
                    "response_format".to_string(),
                    json!({"type": "json_schema", "json_schema": schema}),
                );
            }
            Some("json_object") => {
                out.insert("response_format".to_string(), json!({"type": "json_object"}));
            }
            _ => {}
        }
    }

    Ok(Value::Object(out))
}

/// Function calls join the preceding assistant turn when there is one.
fn attach_tool_call(messages: &mut Vec<Value>, call: Value) {
    if let Some(last) = messages.last_mut() {
        if str_field(last, "role") == Some("assistant") {
            match last.get_mut("tool_calls").and_then(|v| v.as_array_mut()) {
                Some(calls) => calls.push(call),
                None => last["tool_calls"] = json!([call]),
            }
            return;
        }
    }
    messages.push(json!({"role": "assistant", "content": "", "tool_calls": [call]}));
}

fn chat_content_to_input(content: Option<&Value>, text_type: &str) -> Vec<Value> {
    match content {
        Some(Value::String(s)) if !s.is_empty() => vec![json!({"type": text_type, "text": s})],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match str_field(part, "type") {
                Some("image_url") => part
                    .pointer("/image_url/url")
                    .or_else(|| part.get("image_url"))
                    .and_then(|v| v.as_str())
                    .map(|url| json!({"type": "input_image", "image_url": url})),
                _ => str_field(part, "text")
                    .filter(|t| !t.is_empty())
                    .map(|t| json!({"type": text_type, "text": t})),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn chat_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts_text(parts),
        _ => String::new(),
    }
}

pub fn request_from_chat(req: &Value) -> Result<Value, ConversionError> {
    let messages = req
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ConversionError::missing("messages"))?;

    let mut instructions: Vec<String> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    for (i, msg) in messages.iter().enumerate() {
        let role = str_field(msg, "role")
            .ok_or_else(|| ConversionError::missing(format!("messages[{}].role", i)))?;
        match role {
            "system" | "developer" => {
                let text = chat_text(msg.get("content"));
                if input.is_empty() {
                    if !text.is_empty() {
                        instructions.push(text);
                    }
                } else {
                    input.push(json!({
                        "type": "message",
                        "role": "developer",
                        "content": [{"type": "input_text", "text": text}],
                    }));
                }
            }
            "user" => {
                let content = chat_content_to_input(msg.get("content"), "input_text");
                if !content.is_empty() {
                    input.push(json!({"type": "message", "role": "user", "content": content}));
                }
            }
            "assistant" => {
                let content = chat_content_to_input(msg.get("content"), "output_text");
                if !content.is_empty() {
                    input.push(json!({"type": "message", "role": "assistant", "content": content}));
                }
                if let Some(calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
                    for (j, call) in calls.iter().enumerate() {
                        let name = call
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| {
                                ConversionError::missing(format!(
                                    "messages[{}].tool_calls[{}].function.name",
                                    i, j
                                ))
                            })?;
                        let call_id = str_field(call, "id")
                            .filter(|id| !id.is_empty())
                            .map(str::to_string)
                            .unwrap_or_else(|| short_id("call"));
                        let arguments = json_to_string(call.pointer("/function/arguments").unwrap_or(&Value::Null));
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call_id,
                            "name": name,
                            "arguments": if arguments.is_empty() { "{}".to_string() } else { arguments },
                        }));
                    }
                }
            }
            "tool" | "function" => {
                let call_id = str_field(msg, "tool_call_id")
                    .ok_or_else(|| ConversionError::missing(format!("messages[{}].tool_call_id", i)))?;
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": chat_text(msg.get("content")),
                }));
            }
            other => {
                return Err(ConversionError::invalid(
                    format!("messages[{}].role", i),
                    format!("unknown role `{}`", other),
                ))
            }
        }
    }

    let mut out = Map::new();
    for key in ["model", "temperature", "top_p", "stream", "user", "parallel_tool_calls"] {
        if let Some(value) = req.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if !instructions.is_empty() {
        out.insert("instructions".to_string(), json!(instructions.join("\n\n")));
    }
    out.insert("input".to_string(), Value::Array(input));
    if let Some(max) = req.get("max_completion_tokens").or_else(|| req.get("max_tokens")) {
        out.insert("max_output_tokens".to_string(), max.clone());
    }
    if let Some(effort) = req.get("reasoning_effort") {
        out.insert("reasoning".to_string(), json!({"effort": effort}));
    }

    if let Some(tools) = req.get("tools").and_then(|v| v.as_array()) {
        let defs: Vec<Value> = tools
            .iter()
            .filter_map(|t| {
                let function = t.get("function")?;
                let name = str_field(function, "name")?;
                let mut def = json!({
                    "type": "function",
                    "name": name,
                    "parameters": function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                });
                for key in ["description", "strict"] {
                    if let Some(value) = function.get(key) {
                        def[key] = value.clone();
                    }
                }
                Some(def)
            })
            .collect();
        if !defs.is_empty() {
            out.insert("tools".to_string(), Value::Array(defs));
        }
    }

    match req.get("tool_choice") {
        Some(Value::String(choice)) => {
            let mapped = if choice == "required" { "any" } else { choice.as_str() };
            out.insert("tool_choice".to_string(), json!(mapped));
        }
        Some(choice @ Value::Object(_)) => {
            if let Some(name) = choice.pointer("/function/name").and_then(|v| v.as_str()) {
                out.insert("tool_choice".to_string(), json!({"type": "function", "name": name}));
            }
        }
        _ => {}
    }

    if let Some(format) = req.get("response_format") {
        match str_field(format, "type") {
            Some("json_schema") => {
                let spec = format.get("json_schema").cloned().unwrap_or_else(|| json!({}));
                let mut text_format = json!({
                    "type": "json_schema",
                    "name": str_field(&spec, "name").unwrap_or("response"),
                    "schema": spec.get("schema").cloned().unwrap_or_else(|| json!({})),
                });
                if let Some(strict) = spec.get("strict") {
                    text_format["strict"] = strict.clone();
                }
                out.insert("text".to_string(), json!({"format": text_format}));
            }
            Some("json_object") => {
                out.insert("text".to_string(), json!({"format": {"type": "json_object"}}));
            }
            _ => {}
        }
    }

    Ok(Value::Object(out))
}

pub fn response_to_chat(resp: &Value) -> Result<Value, ConversionError> {
    // Some relays hand back the `response.completed` envelope.
    let resp = match resp.get("response") {
        Some(inner) if inner.is_object() && resp.get("output").is_none() => inner,
        _ => resp,
    };
    let output = resp
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ConversionError::missing("output"))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for item in output {
        match str_field(item, "type").unwrap_or("") {
            "message" => {
                if let Some(parts) = item.get("content").and_then(|v| v.as_array()) {
                    text.push_str(&parts_text(parts));
                }
            }
            "reasoning" => {
                for key in ["summary", "content"] {
                    if let Some(parts) = item.get(key).and_then(|v| v.as_array()) {
                        reasoning.push_str(&parts_text(parts));
                    }
                }
            }
            "function_call" => tool_calls.push(json!({
                "id": str_field(item, "call_id").or_else(|| str_field(item, "id")).unwrap_or(""),
                "type": "function",
                "function": {
                    "name": str_field(item, "name").unwrap_or(""),
                    "arguments": json_to_string(item.get("arguments").unwrap_or(&Value::Null)),
                }
            })),
            _ => {}
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls"
    } else {
        match resp.pointer("/incomplete_details/reason").and_then(|v| v.as_str()) {
            Some("max_output_tokens") => "length",
            Some("content_filter") => "content_filter",
            _ => "stop",
        }
    };

    let mut message = json!({"role": "assistant", "content": text});
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let usage = resp.get("usage");
    let read = |pointer: &str| usage.and_then(|u| u.pointer(pointer)).and_then(|v| v.as_u64()).unwrap_or(0);
    let prompt = read("/input_tokens");
    let completion = read("/output_tokens");

    let id = str_field(resp, "id").unwrap_or("");
    Ok(json!({
        "id": format!("chatcmpl-{}", id.trim_start_matches("resp_")),
        "object": "chat.completion",
        "created": resp
            .get("created_at")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        "model": resp.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
            "prompt_tokens_details": {"cached_tokens": read("/input_tokens_details/cached_tokens")},
            "completion_tokens_details": {"reasoning_tokens": read("/output_tokens_details/reasoning_tokens")},
        }
    }))
}

pub(crate) fn message_item(id: &str, text: &str) -> Value {
    json!({
        "id": id,
        "type": "message",
        "status": "completed",
        "role": "assistant",
        "content": [{"type": "output_text", "text": text, "annotations": []}],
    })
}

pub(crate) fn reasoning_item(id: &str, text: &str) -> Value {
    json!({
        "id": id,
        "type": "reasoning",
        "summary": [{"type": "summary_text", "text": text}],
    })
}

pub(crate) fn function_call_item(id: &str, call_id: &str, name: &str, arguments: &str) -> Value {
    json!({
        "id": id,
        "type": "function_call",
        "status": "completed",
        "call_id": call_id,
        "name": name,
        "arguments": arguments,
    })
}

pub fn response_from_chat(resp: &Value) -> Result<Value, ConversionError> {
    let choice = resp
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .ok_or_else(|| ConversionError::missing("choices"))?;
    let empty = json!({});
    let message = choice.get("message").unwrap_or(&empty);

    let mut output: Vec<Value> = Vec::new();
    let reasoning = str_field(message, "reasoning_content").or_else(|| str_field(message, "reasoning"));
    if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
        output.push(reasoning_item(&short_id("rs"), reasoning));
    }

    let text = chat_text(message.get("content"));
    let mut has_visible = false;
    if !text.is_empty() {
        output.push(message_item(&short_id("msg"), &text));
        has_visible = true;
    }
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let name = call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or("");
            let call_id = str_field(call, "id")
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| short_id("call"));
            let arguments = json_to_string(call.pointer("/function/arguments").unwrap_or(&Value::Null));
            let arguments = if arguments.is_empty() { "{}".to_string() } else { arguments };
            output.push(function_call_item(&short_id("fc"), &call_id, name, &arguments));
            has_visible = true;
        }
    }
    if !has_visible {
        output.push(message_item(&short_id("msg"), EMPTY_TEXT_PLACEHOLDER));
    }

    let usage = resp.get("usage");
    let read = |pointer: &str| usage.and_then(|u| u.pointer(pointer)).and_then(|v| v.as_u64()).unwrap_or(0);

    let finish_reason = str_field(choice, "finish_reason").unwrap_or("stop");
    let (status, incomplete_details) = match incomplete_reason(finish_reason) {
        Some(reason) => ("incomplete", json!({"reason": reason})),
        None => ("completed", Value::Null),
    };

    let id = match str_field(resp, "id").filter(|id| !id.is_empty()) {
        Some(id) => format!("resp_{}", id.trim_start_matches("chatcmpl-")),
        None => short_id("resp"),
    };

    Ok(json!({
        "id": id,
        "object": "response",
        "created_at": resp
            .get("created")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        "status": status,
        "incomplete_details": incomplete_details,
        "model": resp.get("model").cloned().unwrap_or(Value::Null),
        "output": output,
        "usage": usage_object(
            read("/prompt_tokens"),
            read("/completion_tokens"),
            read("/prompt_tokens_details/cached_tokens"),
            read("/completion_tokens_details/reasoning_tokens"),
        ),
    }))
}
