// Configuration module for the relay proxy

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::proxy::learning::LearningSink;
use crate::proxy::WireFormat;

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{(\w+)\}").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Cap on bytes held for one unterminated SSE line, frame or tool call.
    #[serde(default = "default_max_stream_buffer")]
    pub max_stream_buffer_bytes: usize,

    /// Keep trying other endpoints after a caller-content 4xx.
    #[serde(default)]
    pub retry_on_client_error: bool,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
            upstream_timeout_secs: default_upstream_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_stream_buffer_bytes: default_max_stream_buffer(),
            retry_on_client_error: false,
            health: HealthConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_upstream_timeout() -> u64 {
    300
}

fn default_stream_idle_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_stream_buffer() -> usize {
    crate::translator::sse::DEFAULT_MAX_BUFFERED_BYTES
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HealthConfig {
    /// Length of the rolling outcome window.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Time a blacklisted endpoint sits out before it is retried.
    #[serde(default = "default_recovery_secs")]
    pub recovery_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            recovery_secs: default_recovery_secs(),
        }
    }
}

fn default_window_secs() -> u64 {
    120
}

fn default_recovery_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    AuthToken,
    #[default]
    Auto,
    None,
}

/// The header carrying the upstream credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthHeader {
    #[serde(rename = "x-api-key")]
    ApiKey,
    #[serde(rename = "authorization")]
    Bearer,
}

impl AuthHeader {
    pub fn header_name(&self) -> &'static str {
        match self {
            AuthHeader::ApiKey => "x-api-key",
            AuthHeader::Bearer => "authorization",
        }
    }

    pub fn header_value(&self, credential: &str) -> String {
        match self {
            AuthHeader::ApiKey => credential.to_string(),
            AuthHeader::Bearer => format!("Bearer {}", credential),
        }
    }
}

/// Which OpenAI sub-format an endpoint should be spoken to in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpenAIPreference {
    #[default]
    Auto,
    Responses,
    ChatCompletions,
}

impl OpenAIPreference {
    pub fn as_format(&self) -> Option<WireFormat> {
        match self {
            OpenAIPreference::Auto => None,
            OpenAIPreference::Responses => Some(WireFormat::OpenAIResponses),
            OpenAIPreference::ChatCompletions => Some(WireFormat::OpenAIChat),
        }
    }

    pub fn from_format(format: WireFormat) -> Self {
        match format {
            WireFormat::OpenAIResponses => OpenAIPreference::Responses,
            WireFormat::OpenAIChat => OpenAIPreference::ChatCompletions,
            WireFormat::Anthropic => OpenAIPreference::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RewriteRule {
    /// Wildcard pattern, `*` matches any run of characters.
    pub source_pattern: String,
    pub target_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ModelRewriteConfig {
    #[serde(default)]
    pub rules: Vec<RewriteRule>,
}

/// Runtime-discovered capabilities of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct LearnedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<AuthHeader>,
    #[serde(default)]
    pub openai_preference: OpenAIPreference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_responses: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unsupported_params: BTreeSet<String>,
}

impl LearnedState {
    pub fn is_empty(&self) -> bool {
        *self == LearnedState::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointConfig {
    pub name: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub url_anthropic: Option<String>,

    #[serde(default)]
    pub url_openai_chat: Option<String>,

    #[serde(default)]
    pub url_openai_responses: Option<String>,

    #[serde(default)]
    pub auth_type: AuthType,

    #[serde(default)]
    pub auth_value: String,

    #[serde(default)]
    pub model_rewrite: ModelRewriteConfig,

    #[serde(default)]
    pub openai_preference: OpenAIPreference,

    #[serde(default)]
    pub count_tokens_enabled: bool,

    /// Only serve requests from this client type (`claude-code`, `codex`, `generic`).
    #[serde(default)]
    pub client_type: Option<String>,

    /// The endpoint only accepts its own formats; conversion is disabled.
    #[serde(default)]
    pub native_format: bool,

    /// Always speak this wire format to the endpoint.
    #[serde(default)]
    pub target_format: Option<WireFormat>,

    #[serde(default = "default_true")]
    pub business_error_safe: bool,

    #[serde(default)]
    pub config_error_safe: bool,

    #[serde(default)]
    pub server_error_safe: bool,

    #[serde(default)]
    pub learned: LearnedState,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            tags: Vec::new(),
            url_anthropic: None,
            url_openai_chat: None,
            url_openai_responses: None,
            auth_type: AuthType::Auto,
            auth_value: String::new(),
            model_rewrite: ModelRewriteConfig::default(),
            openai_preference: OpenAIPreference::Auto,
            count_tokens_enabled: false,
            client_type: None,
            native_format: false,
            target_format: None,
            business_error_safe: true,
            config_error_safe: false,
            server_error_safe: false,
            learned: LearnedState::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Substitute `${VAR}` with the environment value (empty when unset).
pub fn resolve_env(raw: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(raw, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Expand a leading `~` to the home directory.
pub fn resolve_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

pub fn parse_config(raw: &str) -> Result<AppConfig> {
    let resolved = resolve_env(raw);
    let config: AppConfig = serde_yaml::from_str(&resolved).context("invalid config YAML")?;
    Ok(config)
}

/// Owns the on-disk configuration and the learned-state sidecar.
///
/// The main file is never rewritten, so `${VAR}` placeholders stay intact;
/// learned capabilities go to `<config>.learned.yaml`.
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: RwLock<AppConfig>,
    learned: RwLock<BTreeMap<String, LearnedState>>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {:?}", path))?;
            parse_config(&content)?
        } else {
            tracing::warn!("Config {:?} not found, writing defaults", path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let default_config = AppConfig::default();
            std::fs::write(path, serde_yaml::to_string(&default_config)?)?;
            default_config
        };

        let learned_path = learned_path_for(path);
        let learned: BTreeMap<String, LearnedState> = if learned_path.exists() {
            let content = std::fs::read_to_string(&learned_path)?;
            serde_yaml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable learned state {:?}: {}", learned_path, e);
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };

        let store = Self {
            path: Some(path.to_path_buf()),
            config: RwLock::new(config),
            learned: RwLock::new(learned),
        };
        store.merge_learned();

        tracing::info!("Config loaded from {:?}", path);
        Ok(store)
    }

    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            path: None,
            config: RwLock::new(config),
            learned: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn learned_for(&self, endpoint: &str) -> Option<LearnedState> {
        self.learned.read().get(endpoint).cloned()
    }

    fn merge_learned(&self) {
        let learned = self.learned.read();
        let mut config = self.config.write();
        for endpoint in config.endpoints.iter_mut() {
            if let Some(state) = learned.get(&endpoint.name) {
                endpoint.learned = state.clone();
            }
        }
    }

    fn save_learned(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_yaml::to_string(&*self.learned.read())?;
        std::fs::write(learned_path_for(path), content)?;
        Ok(())
    }
}

impl LearningSink for ConfigStore {
    fn persist(&self, endpoint: &str, learned: &LearnedState) {
        {
            let mut map = self.learned.write();
            if map.get(endpoint) == Some(learned) {
                return;
            }
            map.insert(endpoint.to_string(), learned.clone());
        }
        if let Some(entry) = self
            .config
            .write()
            .endpoints
            .iter_mut()
            .find(|e| e.name == endpoint)
        {
            entry.learned = learned.clone();
        }
        if let Err(e) = self.save_learned() {
            tracing::warn!("Failed to persist learned state for {}: {}", endpoint, e);
        }
    }
}

fn learned_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".learned.yaml");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
port: 8417
api-keys: ["local-key"]
health:
  window-secs: 60
endpoints:
  - name: primary
    priority: 1
    tags: [fast]
    url-anthropic: "https://api.example.com"
    auth-type: api_key
    auth-value: "${RELAY_TEST_SECRET}"
    model-rewrite:
      rules:
        - source-pattern: "claude-*"
          target-model: "glm-4.6"
  - name: openai
    url-openai-chat: "https://openai.example.com/v1"
    openai-preference: chat_completions
    target-format: openai_chat
    server-error-safe: true
"#;

    #[test]
    fn test_resolve_env_substitutes_existing_var() {
        std::env::set_var("RELAY_TEST_ENV_A", "hello");
        assert_eq!(resolve_env("x-${RELAY_TEST_ENV_A}-y"), "x-hello-y");
        std::env::remove_var("RELAY_TEST_ENV_A");
    }

    #[test]
    fn test_resolve_env_missing_var_becomes_empty() {
        assert_eq!(resolve_env("${RELAY_SURELY_UNSET_123}"), "");
        assert_eq!(resolve_env("plain"), "plain");
    }

    #[test]
    fn test_parse_config_fields_and_defaults() {
        std::env::set_var("RELAY_TEST_SECRET", "sk-test");
        let config = parse_config(SAMPLE).unwrap();
        std::env::remove_var("RELAY_TEST_SECRET");

        assert_eq!(config.port, 8417);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.health.window_secs, 60);
        assert_eq!(config.health.recovery_secs, 300);
        assert_eq!(config.max_stream_buffer_bytes, 8 * 1024 * 1024);
        assert_eq!(config.endpoints.len(), 2);

        let primary = &config.endpoints[0];
        assert_eq!(primary.auth_type, AuthType::ApiKey);
        assert_eq!(primary.auth_value, "sk-test");
        assert!(primary.enabled);
        assert!(primary.business_error_safe);
        assert!(!primary.server_error_safe);
        assert_eq!(primary.model_rewrite.rules[0].target_model, "glm-4.6");

        let openai = &config.endpoints[1];
        assert_eq!(openai.openai_preference, OpenAIPreference::ChatCompletions);
        assert_eq!(openai.target_format, Some(WireFormat::OpenAIChat));
        assert!(openai.server_error_safe);
        assert_eq!(openai.auth_type, AuthType::Auto);
    }

    #[test]
    fn test_learned_state_is_persisted_to_sidecar() {
        let dir = std::env::temp_dir().join(format!("relay-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        let mut learned = LearnedState::default();
        learned.auth_header = Some(AuthHeader::Bearer);
        learned.unsupported_params.insert("top_p".to_string());
        store.persist("primary", &learned);

        let reloaded = ConfigStore::load(&path).unwrap();
        let endpoint = reloaded
            .get()
            .endpoints
            .into_iter()
            .find(|e| e.name == "primary")
            .unwrap();
        assert_eq!(endpoint.learned, learned);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("${RELAY_TEST_SECRET}"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_config_writes_defaults() {
        let dir = std::env::temp_dir().join(format!("relay-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.yaml");
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.get().port, 3000);
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
