// Endpoint registry - configured upstreams plus their runtime state

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::health::{BlacklistPolicy, HealthSettings, HealthState, HealthStatus};
use super::WireFormat;
use crate::config::{EndpointConfig, LearnedState, OpenAIPreference};
use crate::error::{ErrorCategory, RegistryError};

/// One configured upstream. Identity is immutable; learned and health state
/// are behind their own locks so concurrent requests never interleave
/// partial writes to the same endpoint.
#[derive(Debug)]
pub struct Endpoint {
    config: EndpointConfig,
    enabled: AtomicBool,
    learned: RwLock<LearnedState>,
    health: Mutex<HealthState>,
    policy: BlacklistPolicy,
    settings: HealthSettings,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, settings: HealthSettings) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            learned: RwLock::new(config.learned.clone()),
            health: Mutex::new(HealthState::default()),
            policy: BlacklistPolicy::from_endpoint(&config),
            settings,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn learned(&self) -> LearnedState {
        self.learned.read().clone()
    }

    /// Apply a learning mutation; returns the new state only if it changed.
    pub fn update_learned<F>(&self, f: F) -> Option<LearnedState>
    where
        F: FnOnce(&mut LearnedState),
    {
        let mut learned = self.learned.write();
        let before = learned.clone();
        f(&mut learned);
        if *learned == before {
            None
        } else {
            Some(learned.clone())
        }
    }

    pub fn has_tags(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|tag| self.config.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
    }

    pub fn has_any_url(&self) -> bool {
        self.config.url_anthropic.is_some() || self.is_openai_capable()
    }

    pub fn is_openai_capable(&self) -> bool {
        self.config.url_openai_chat.is_some() || self.config.url_openai_responses.is_some()
    }

    /// Full upstream URL for `format`, if the endpoint exposes that family.
    pub fn url_for(&self, format: WireFormat) -> Option<String> {
        let base = match format {
            WireFormat::Anthropic => self.config.url_anthropic.as_deref()?,
            WireFormat::OpenAIChat => self
                .config
                .url_openai_chat
                .as_deref()
                .or(self.config.url_openai_responses.as_deref())?,
            WireFormat::OpenAIResponses => self
                .config
                .url_openai_responses
                .as_deref()
                .or(self.config.url_openai_chat.as_deref())?,
        };
        Some(join_upstream_path(base, format))
    }

    /// Whether the endpoint serves `format` without any conversion.
    pub fn serves_natively(&self, format: WireFormat) -> bool {
        match format {
            WireFormat::Anthropic => self.config.url_anthropic.is_some(),
            WireFormat::OpenAIChat => {
                self.is_openai_capable()
                    && self.config.openai_preference != OpenAIPreference::Responses
            }
            WireFormat::OpenAIResponses => {
                self.is_openai_capable()
                    && self.config.openai_preference != OpenAIPreference::ChatCompletions
                    && self.learned.read().supports_responses != Some(false)
            }
        }
    }

    /// Upstream formats to try, in order, for a client speaking `client_format`.
    /// Empty when the endpoint cannot serve the request at all.
    pub fn upstream_attempts(&self, client_format: WireFormat) -> Vec<WireFormat> {
        if let Some(target) = self.config.target_format {
            return if self.url_for(target).is_some() {
                vec![target]
            } else {
                Vec::new()
            };
        }

        if client_format.is_openai() && self.is_openai_capable() {
            return self.openai_order(Some(client_format));
        }
        if self.serves_natively(client_format) {
            return vec![client_format];
        }
        if self.config.native_format {
            return Vec::new();
        }
        if self.is_openai_capable() {
            self.openai_order(None)
        } else if self.config.url_anthropic.is_some() {
            vec![WireFormat::Anthropic]
        } else {
            Vec::new()
        }
    }

    /// OpenAI sub-format order: configured preference, then learned
    /// preference, then the client's own format, then `/responses` as a trial.
    fn openai_order(&self, client_format: Option<WireFormat>) -> Vec<WireFormat> {
        if let Some(fixed) = self.config.openai_preference.as_format() {
            return vec![fixed];
        }

        let learned = self.learned.read();
        let responses_ok = learned.supports_responses != Some(false);
        let first = learned
            .openai_preference
            .as_format()
            .or(client_format)
            .unwrap_or(WireFormat::OpenAIResponses);
        drop(learned);

        let mut order = Vec::with_capacity(2);
        if first != WireFormat::OpenAIResponses || responses_ok {
            order.push(first);
        }
        if let Some(sibling) = first.openai_sibling() {
            if sibling != WireFormat::OpenAIResponses || responses_ok {
                order.push(sibling);
            }
        }
        order
    }

    pub fn needs_conversion(&self, client_format: WireFormat) -> bool {
        self.upstream_attempts(client_format)
            .first()
            .map(|first| *first != client_format)
            .unwrap_or(true)
    }

    /// Current status after applying time-based transitions.
    pub fn health_status(&self, now: Instant) -> HealthStatus {
        self.health.lock().refresh(now, &self.settings)
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.health.lock().last_latency()
    }

    pub fn record_success(&self, latency: Option<Duration>) {
        self.health
            .lock()
            .record_success(Instant::now(), latency, &self.settings);
    }

    pub fn record_failure(&self, category: ErrorCategory, detail: &str) {
        let blacklisted = self.health.lock().record_failure(
            Instant::now(),
            category,
            detail,
            &self.policy,
            &self.settings,
        );
        if blacklisted {
            tracing::warn!(
                "Endpoint {} blacklisted for {}s after repeated {}",
                self.name(),
                self.settings.recovery.as_secs(),
                category.as_str()
            );
        }
    }

    pub fn manual_recover(&self) {
        self.health.lock().manual_recover();
        tracing::info!("Endpoint {} manually recovered", self.name());
    }

    pub fn view(&self) -> EndpointView {
        let now = Instant::now();
        let mut health = self.health.lock();
        let status = health.refresh(now, &self.settings);
        EndpointView {
            name: self.config.name.clone(),
            priority: self.config.priority,
            enabled: self.is_enabled(),
            tags: self.config.tags.clone(),
            formats: WireFormat::ALL
                .into_iter()
                .filter(|f| self.serves_natively(*f))
                .collect(),
            status,
            blacklist_reason: health.reason().map(str::to_string),
            window_samples: health.sample_count(),
            last_latency_ms: health.last_latency().map(|d| d.as_millis() as u64),
            learned: self.learned(),
        }
    }
}

/// Management snapshot of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointView {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub tags: Vec<String>,
    pub formats: Vec<WireFormat>,
    pub status: HealthStatus,
    pub blacklist_reason: Option<String>,
    pub window_samples: usize,
    pub last_latency_ms: Option<u64>,
    pub learned: LearnedState,
}

fn join_upstream_path(base: &str, format: WireFormat) -> String {
    let base = base.trim_end_matches('/');
    let path = format.upstream_path();
    if base.ends_with(path) {
        return base.to_string();
    }
    match format {
        WireFormat::Anthropic if base.ends_with("/v1") => format!("{}/messages", base),
        WireFormat::OpenAIChat => {
            let root = base.strip_suffix(WireFormat::OpenAIResponses.upstream_path()).unwrap_or(base);
            format!("{}{}", root, path)
        }
        WireFormat::OpenAIResponses => {
            let root = base.strip_suffix(WireFormat::OpenAIChat.upstream_path()).unwrap_or(base);
            format!("{}{}", root, path)
        }
        WireFormat::Anthropic => format!("{}{}", base, path),
    }
}

/// All endpoints, in configuration order.
pub struct Registry {
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    settings: HealthSettings,
}

impl Registry {
    pub fn new(configs: Vec<EndpointConfig>, settings: HealthSettings) -> Result<Self, RegistryError> {
        let registry = Self {
            endpoints: RwLock::new(Vec::with_capacity(configs.len())),
            settings,
        };
        for config in configs {
            registry.add(config)?;
        }
        Ok(registry)
    }

    pub fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    pub fn add(&self, config: EndpointConfig) -> Result<Arc<Endpoint>, RegistryError> {
        let endpoint = Arc::new(Endpoint::new(config, self.settings));
        if !endpoint.has_any_url() {
            return Err(RegistryError::NoUrl(endpoint.name().to_string()));
        }
        let mut endpoints = self.endpoints.write();
        if endpoints.iter().any(|e| e.name() == endpoint.name()) {
            return Err(RegistryError::Duplicate(endpoint.name().to_string()));
        }
        endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|e| e.name() != name);
        if endpoints.len() == before {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anthropic_only(name: &str) -> EndpointConfig {
        let mut config = EndpointConfig::new(name);
        config.url_anthropic = Some("https://api.example.com".into());
        config
    }

    fn openai(name: &str) -> EndpointConfig {
        let mut config = EndpointConfig::new(name);
        config.url_openai_chat = Some("https://openai.example.com/v1".into());
        config
    }

    #[test]
    fn test_url_joining() {
        let e = Endpoint::new(anthropic_only("a"), HealthSettings::default());
        assert_eq!(
            e.url_for(WireFormat::Anthropic).as_deref(),
            Some("https://api.example.com/v1/messages")
        );

        let mut config = anthropic_only("b");
        config.url_anthropic = Some("https://api.example.com/v1/".into());
        let e = Endpoint::new(config, HealthSettings::default());
        assert_eq!(
            e.url_for(WireFormat::Anthropic).as_deref(),
            Some("https://api.example.com/v1/messages")
        );

        let e = Endpoint::new(openai("c"), HealthSettings::default());
        assert_eq!(
            e.url_for(WireFormat::OpenAIResponses).as_deref(),
            Some("https://openai.example.com/v1/responses")
        );
        assert_eq!(e.url_for(WireFormat::Anthropic), None);

        let mut config = EndpointConfig::new("d");
        config.url_openai_responses = Some("https://x.example.com/v1/responses".into());
        let e = Endpoint::new(config, HealthSettings::default());
        assert_eq!(
            e.url_for(WireFormat::OpenAIChat).as_deref(),
            Some("https://x.example.com/v1/chat/completions")
        );
    }

    #[test]
    fn test_anthropic_only_endpoint_converts_for_openai_clients() {
        let e = Endpoint::new(anthropic_only("a"), HealthSettings::default());
        assert_eq!(
            e.upstream_attempts(WireFormat::OpenAIResponses),
            vec![WireFormat::Anthropic]
        );
        assert!(e.needs_conversion(WireFormat::OpenAIResponses));
        assert!(!e.needs_conversion(WireFormat::Anthropic));
    }

    #[test]
    fn test_native_format_disables_conversion() {
        let mut config = anthropic_only("a");
        config.native_format = true;
        let e = Endpoint::new(config, HealthSettings::default());
        assert!(e.upstream_attempts(WireFormat::OpenAIChat).is_empty());
        assert_eq!(e.upstream_attempts(WireFormat::Anthropic), vec![WireFormat::Anthropic]);
    }

    #[test]
    fn test_openai_format_order_follows_learning() {
        let e = Endpoint::new(openai("o"), HealthSettings::default());
        assert_eq!(
            e.upstream_attempts(WireFormat::Anthropic),
            vec![WireFormat::OpenAIResponses, WireFormat::OpenAIChat]
        );
        assert_eq!(
            e.upstream_attempts(WireFormat::OpenAIChat),
            vec![WireFormat::OpenAIChat, WireFormat::OpenAIResponses]
        );

        e.update_learned(|l| {
            l.openai_preference = OpenAIPreference::ChatCompletions;
            l.supports_responses = Some(false);
        });
        assert_eq!(e.upstream_attempts(WireFormat::Anthropic), vec![WireFormat::OpenAIChat]);
        assert_eq!(e.upstream_attempts(WireFormat::OpenAIResponses), vec![WireFormat::OpenAIChat]);
        assert!(!e.serves_natively(WireFormat::OpenAIResponses));
    }

    #[test]
    fn test_target_format_override() {
        let mut config = openai("o");
        config.url_anthropic = Some("https://api.example.com".into());
        config.target_format = Some(WireFormat::Anthropic);
        let e = Endpoint::new(config, HealthSettings::default());
        assert_eq!(e.upstream_attempts(WireFormat::OpenAIChat), vec![WireFormat::Anthropic]);
    }

    #[test]
    fn test_update_learned_reports_changes_only() {
        let e = Endpoint::new(openai("o"), HealthSettings::default());
        assert!(e
            .update_learned(|l| {
                l.unsupported_params.insert("top_p".into());
            })
            .is_some());
        assert!(e
            .update_learned(|l| {
                l.unsupported_params.insert("top_p".into());
            })
            .is_none());
        assert_eq!(e.learned().unsupported_params.len(), 1);
    }

    #[test]
    fn test_registry_add_remove() {
        let registry = Registry::new(vec![anthropic_only("a")], HealthSettings::default()).unwrap();
        assert_eq!(
            registry.add(anthropic_only("a")).unwrap_err(),
            RegistryError::Duplicate("a".into())
        );
        assert_eq!(
            registry.add(EndpointConfig::new("empty")).unwrap_err(),
            RegistryError::NoUrl("empty".into())
        );
        registry.add(openai("b")).unwrap();
        assert_eq!(registry.len(), 2);
        registry.remove("a").unwrap();
        assert!(registry.get("a").is_none());
        assert_eq!(registry.remove("a").unwrap_err(), RegistryError::NotFound("a".into()));
    }

    #[test]
    fn test_tags_must_all_match() {
        let mut config = anthropic_only("a");
        config.tags = vec!["fast".into(), "cheap".into()];
        let e = Endpoint::new(config, HealthSettings::default());
        assert!(e.has_tags(&[]));
        assert!(e.has_tags(&["FAST".into()]));
        assert!(!e.has_tags(&["fast".into(), "eu".into()]));
    }
}
