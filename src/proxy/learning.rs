//! Per-endpoint capability discovery.
//!
//! Three loops share the endpoint's learned state: which auth header works,
//! which OpenAI sub-format to speak, and which request parameters the
//! upstream rejects. Every update is idempotent and goes through
//! [`Endpoint::update_learned`], so concurrent requests cannot interleave
//! partial writes. Changes are handed to a [`LearningSink`] for persistence.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

use super::registry::Endpoint;
use super::WireFormat;
use crate::config::{AuthHeader, AuthType, LearnedState, OpenAIPreference};

/// Receives learned state whenever it changes.
pub trait LearningSink: Send + Sync {
    fn persist(&self, endpoint: &str, learned: &LearnedState);
}

/// Keeps learned state in memory only.
pub struct NoopSink;

impl LearningSink for NoopSink {
    fn persist(&self, _endpoint: &str, _learned: &LearnedState) {}
}

static UNSUPPORTED_PARAM_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?i)parameter\s+['"`]?([A-Za-z0-9_.]+)['"`]?\s+is\s+not\s+supported"#,
        r#"(?i)unsupported\s+parameter:?\s*['"`]?([A-Za-z0-9_.]+)"#,
        r#"(?i)unrecognized\s+request\s+argument\s+supplied:\s*['"`]?([A-Za-z0-9_.]+)"#,
        r#"(?i)unknown\s+(?:field|parameter)[:\s]+['"`]?([A-Za-z0-9_.]+)"#,
        r#"(?i)['"`]([A-Za-z0-9_.]+)['"`]\s+is\s+not\s+(?:supported|permitted|allowed)"#,
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Fields that carry the request itself and are never stripped.
const PROTECTED_PARAMS: &[&str] = &["model", "messages", "input"];

/// Human-readable message from an upstream error body.
pub fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("message"),
            value.get("error"),
            value.get("detail"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(text) = candidate.as_str() {
                return text.to_string();
            }
        }
    }
    body.to_string()
}

/// Name of the request field an upstream error says it rejected.
pub fn extract_unsupported_param(body: &str) -> Option<String> {
    let message = error_message(body);
    UNSUPPORTED_PARAM_PATTERNS
        .iter()
        .find_map(|re| re.captures(&message))
        .map(|caps| caps[1].trim_matches('.').to_string())
        .filter(|name| !name.is_empty() && !PROTECTED_PARAMS.contains(&name.as_str()))
}

/// Remove learned-unsupported fields; dotted names address one nested level.
/// Returns the names that were actually present.
pub fn strip_params(body: &mut Value, params: &BTreeSet<String>) -> Vec<String> {
    let mut removed = Vec::new();
    let Some(obj) = body.as_object_mut() else {
        return removed;
    };
    for param in params {
        let hit = match param.split_once('.') {
            Some((parent, child)) => obj
                .get_mut(parent)
                .and_then(|v| v.as_object_mut())
                .and_then(|inner| inner.remove(child))
                .is_some(),
            None => obj.remove(param).is_some(),
        };
        if hit {
            removed.push(param.clone());
        }
    }
    removed
}

/// Headers to try, in order, for an endpoint's credential.
pub fn auth_header_order(auth_type: AuthType, learned: &LearnedState) -> Vec<AuthHeader> {
    match auth_type {
        AuthType::ApiKey => vec![AuthHeader::ApiKey],
        AuthType::AuthToken => vec![AuthHeader::Bearer],
        AuthType::None => Vec::new(),
        AuthType::Auto => match learned.auth_header {
            Some(header) => vec![header],
            None => vec![AuthHeader::ApiKey, AuthHeader::Bearer],
        },
    }
}

/// A 4xx on a trial `/responses` call that means "wrong sub-format", not auth.
pub fn is_format_rejection(format: WireFormat, status: u16) -> bool {
    match format {
        WireFormat::OpenAIResponses => (400..500).contains(&status) && status != 401 && status != 403,
        WireFormat::OpenAIChat => status == 404 || status == 405,
        WireFormat::Anthropic => false,
    }
}

pub fn remember_auth(endpoint: &Endpoint, header: AuthHeader, sink: &dyn LearningSink) {
    if endpoint.config().auth_type != AuthType::Auto {
        return;
    }
    let changed = endpoint.update_learned(|l| l.auth_header = Some(header));
    if let Some(learned) = changed {
        tracing::info!(
            "Endpoint {} auth detected: {}",
            endpoint.name(),
            header.header_name()
        );
        sink.persist(endpoint.name(), &learned);
    }
}

/// Record a successful OpenAI sub-format. `responses_rejected` is set when
/// the trial `/responses` call failed with a format rejection earlier in the
/// same attempt.
pub fn remember_openai_format(
    endpoint: &Endpoint,
    format: WireFormat,
    responses_rejected: bool,
    sink: &dyn LearningSink,
) {
    if !format.is_openai() {
        return;
    }
    let changed = endpoint.update_learned(|l| {
        l.openai_preference = OpenAIPreference::from_format(format);
        if format == WireFormat::OpenAIResponses {
            l.supports_responses = Some(true);
        } else if responses_rejected {
            l.supports_responses = Some(false);
        }
    });
    if let Some(learned) = changed {
        tracing::info!(
            "Endpoint {} OpenAI preference learned: {}",
            endpoint.name(),
            format
        );
        sink.persist(endpoint.name(), &learned);
    }
}

/// Add a rejected parameter. Returns `false` when it was already known.
pub fn remember_unsupported_param(endpoint: &Endpoint, param: &str, sink: &dyn LearningSink) -> bool {
    let changed = endpoint.update_learned(|l| {
        l.unsupported_params.insert(param.to_string());
    });
    match changed {
        Some(learned) => {
            tracing::warn!(
                "Endpoint {} rejects parameter `{}`, stripping it from now on",
                endpoint.name(),
                param
            );
            sink.persist(endpoint.name(), &learned);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::proxy::health::HealthSettings;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(String, LearnedState)>>,
    }

    impl LearningSink for RecordingSink {
        fn persist(&self, endpoint: &str, learned: &LearnedState) {
            self.writes.lock().push((endpoint.to_string(), learned.clone()));
        }
    }

    fn openai_endpoint() -> Endpoint {
        let mut config = EndpointConfig::new("o");
        config.url_openai_chat = Some("https://o.example.com/v1".into());
        Endpoint::new(config, HealthSettings::default())
    }

    #[test]
    fn test_extract_unsupported_param_variants() {
        let cases = [
            (r#"{"error":{"message":"parameter 'top_p' is not supported"}}"#, "top_p"),
            (r#"{"error":{"message":"Unsupported parameter: 'temperature' is not supported with this model."}}"#, "temperature"),
            (r#"{"error":{"message":"Unrecognized request argument supplied: parallel_tool_calls"}}"#, "parallel_tool_calls"),
            (r#"{"detail":"unknown field `metadata`, expected one of ..."}"#, "metadata"),
            (r#"{"message":"\"reasoning.effort\" is not permitted"}"#, "reasoning.effort"),
        ];
        for (body, expected) in cases {
            assert_eq!(extract_unsupported_param(body).as_deref(), Some(expected), "{}", body);
        }
        assert_eq!(extract_unsupported_param(r#"{"error":{"message":"model not found"}}"#), None);
        assert_eq!(extract_unsupported_param("parameter 'model' is not supported"), None);
    }

    #[test]
    fn test_strip_params_top_level_and_nested() {
        let mut body = json!({"model": "m", "top_p": 0.9, "reasoning": {"effort": "high", "summary": "auto"}});
        let params: BTreeSet<String> = ["top_p", "reasoning.effort", "seed"]
            .into_iter()
            .map(String::from)
            .collect();
        let removed = strip_params(&mut body, &params);
        assert_eq!(removed, vec!["reasoning.effort".to_string(), "top_p".to_string()]);
        assert_eq!(body, json!({"model": "m", "reasoning": {"summary": "auto"}}));
    }

    #[test]
    fn test_auth_header_order() {
        let mut learned = LearnedState::default();
        assert_eq!(auth_header_order(AuthType::ApiKey, &learned), vec![AuthHeader::ApiKey]);
        assert_eq!(auth_header_order(AuthType::AuthToken, &learned), vec![AuthHeader::Bearer]);
        assert!(auth_header_order(AuthType::None, &learned).is_empty());
        assert_eq!(
            auth_header_order(AuthType::Auto, &learned),
            vec![AuthHeader::ApiKey, AuthHeader::Bearer]
        );
        learned.auth_header = Some(AuthHeader::Bearer);
        assert_eq!(auth_header_order(AuthType::Auto, &learned), vec![AuthHeader::Bearer]);
    }

    #[test]
    fn test_format_rejection() {
        assert!(is_format_rejection(WireFormat::OpenAIResponses, 404));
        assert!(is_format_rejection(WireFormat::OpenAIResponses, 400));
        assert!(!is_format_rejection(WireFormat::OpenAIResponses, 401));
        assert!(!is_format_rejection(WireFormat::OpenAIResponses, 403));
        assert!(!is_format_rejection(WireFormat::OpenAIChat, 400));
        assert!(is_format_rejection(WireFormat::OpenAIChat, 404));
    }

    #[test]
    fn test_unsupported_param_learning_is_idempotent() {
        let endpoint = openai_endpoint();
        let sink = RecordingSink::default();
        assert!(remember_unsupported_param(&endpoint, "top_p", &sink));
        assert!(!remember_unsupported_param(&endpoint, "top_p", &sink));
        assert_eq!(endpoint.learned().unsupported_params.len(), 1);
        assert_eq!(sink.writes.lock().len(), 1);
    }

    #[test]
    fn test_openai_preference_learning() {
        let endpoint = openai_endpoint();
        let sink = RecordingSink::default();
        remember_openai_format(&endpoint, WireFormat::OpenAIChat, true, &sink);
        let learned = endpoint.learned();
        assert_eq!(learned.openai_preference, OpenAIPreference::ChatCompletions);
        assert_eq!(learned.supports_responses, Some(false));

        remember_openai_format(&endpoint, WireFormat::OpenAIChat, true, &sink);
        assert_eq!(sink.writes.lock().len(), 1);
    }

    #[test]
    fn test_auth_learning_only_for_auto() {
        let sink = RecordingSink::default();
        let endpoint = openai_endpoint();
        remember_auth(&endpoint, AuthHeader::Bearer, &sink);
        assert_eq!(endpoint.learned().auth_header, Some(AuthHeader::Bearer));

        let mut config = EndpointConfig::new("fixed");
        config.url_anthropic = Some("https://a.example.com".into());
        config.auth_type = AuthType::ApiKey;
        let fixed = Endpoint::new(config, HealthSettings::default());
        remember_auth(&fixed, AuthHeader::ApiKey, &sink);
        assert_eq!(fixed.learned().auth_header, None);
        assert_eq!(sink.writes.lock().len(), 1);
    }
}
