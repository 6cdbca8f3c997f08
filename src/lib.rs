// Relay Proxy - format-converting reverse proxy for AI coding-assistant clients

pub mod api;
pub mod config;
pub mod error;
pub mod proxy;
pub mod translator;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::ConfigStore;
use proxy::health::HealthSettings;
use proxy::orchestrator::{Orchestrator, OrchestratorSettings};
use proxy::registry::Registry;
use proxy::upstream::UpstreamClient;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}

/// Load the config, build the registry and serve until Ctrl-C.
pub async fn run(config_path: &Path) -> Result<()> {
    init_tracing();

    let store = Arc::new(ConfigStore::load(config_path)?);
    let config = store.get();

    let registry = Arc::new(Registry::new(
        config.endpoints.clone(),
        HealthSettings::from(config.health),
    )?);
    if registry.is_empty() {
        tracing::warn!("No endpoints configured; every request will fail until one is added");
    } else {
        tracing::info!("Loaded {} endpoint(s)", registry.len());
    }

    let client = UpstreamClient::new(
        Duration::from_secs(config.connect_timeout_secs),
        Duration::from_secs(config.upstream_timeout_secs),
    )?;
    let orchestrator = Orchestrator::new(
        registry,
        store.clone(),
        client,
        OrchestratorSettings::from_config(&config),
    );

    let state = api::AppState::new(Arc::new(orchestrator), config.api_keys.clone());
    let addr = format!("{}:{}", config.host, config.port);

    api::serve(state, &addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutting down...");
    })
    .await
}
