// Model name rewriting - first matching wildcard rule wins

use serde_json::{json, Value};

use crate::config::RewriteRule;

/// Case-insensitive glob match where `*` spans any run of characters.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let candidate = candidate.to_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate.as_str();
    let first = parts[0];
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

pub fn resolve_model<'a>(rules: &'a [RewriteRule], model: &str) -> Option<&'a str> {
    rules
        .iter()
        .find(|rule| wildcard_match(&rule.source_pattern, model))
        .map(|rule| rule.target_model.as_str())
}

/// Rewrite `model` in place, returning the original name when it changed.
pub fn apply_rewrite(rules: &[RewriteRule], body: &mut Value) -> Option<String> {
    let original = body.get("model").and_then(|v| v.as_str())?.to_string();
    let target = resolve_model(rules, &original)?;
    if target == original {
        return None;
    }
    tracing::debug!("Rewriting model {} -> {}", original, target);
    body["model"] = json!(target);
    Some(original)
}

/// Put the client's model name back into a response object or stream event.
pub fn restore_model(value: &mut Value, model: &str) {
    if let Some(obj) = value.as_object_mut() {
        if obj.contains_key("model") {
            obj.insert("model".to_string(), json!(model));
        }
        for nested in ["message", "response"] {
            if let Some(inner) = obj.get_mut(nested).and_then(|v| v.as_object_mut()) {
                if inner.contains_key("model") {
                    inner.insert("model".to_string(), json!(model));
                }
            }
        }
    }
}

/// Line-level restoration for passthrough SSE streams.
pub fn restore_model_in_sse_line(line: &str, model: &str) -> Option<String> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" || !data.contains("\"model\"") {
        return None;
    }
    let mut value: Value = serde_json::from_str(data).ok()?;
    restore_model(&mut value, model);
    Some(format!("data: {}", value))
}
