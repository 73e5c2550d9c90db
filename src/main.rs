//! Echo Orchestrator server
//!
//! Loads settings, plugins and the execution graph, then serves the dispatch
//! facade over HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use echo_orchestrator::config::Settings;
use echo_orchestrator::orchestrator::{Dispatcher, Graph, SessionStore};
use echo_orchestrator::plugins::{load_plugins, CapabilityRegistry, PluginCatalog, PluginContext};
use echo_orchestrator::{server, telemetry};

fn load_settings() -> Result<Settings> {
    let path = std::env::args().nth(1).or_else(|| std::env::var("ECHO_CONFIG").ok());
    let mut settings = match path {
        Some(path) => Settings::load(&path)?,
        None => {
            info!("No settings file given; using defaults");
            Settings::default()
        }
    };
    settings.apply_overrides(|key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();
    telemetry::init_telemetry(telemetry::DEFAULT_FILTER)?;

    let settings = load_settings()?;

    let factory = Arc::new(settings.model_factory());
    let registry = Arc::new(CapabilityRegistry::new());
    let catalog = PluginCatalog::with_builtins();
    let context = PluginContext::new(factory.clone(), &settings.default_provider, &settings.default_model);

    let report = load_plugins(&settings.plugin_dir, &catalog, &registry, &context).await?;
    for (plugin, reason) in &report.failed {
        warn!("Plugin {} did not load: {}", plugin, reason);
    }

    let graph = Graph::load(&settings.graph_path)
        .with_context(|| format!("Failed to load graph from {:?}", settings.graph_path))?;
    graph
        .check_capabilities(&registry)
        .await
        .context("Graph does not match the loaded plugins")?;
    info!("Graph loaded: {} nodes, entry '{}'", graph.len(), graph.entry());

    let store = Arc::new(
        SessionStore::new(settings.checkpointer(), settings.session_ttl())
            .with_suspended_policy(settings.suspended_policy),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(graph),
        registry.clone(),
        store,
        factory,
        settings.dispatcher_config(),
    ));

    let _expiry = dispatcher.spawn_expiry_task(settings.expiry_interval());
    if let Some(every) = settings.health_check_interval() {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let unhealthy = registry.health_check_all().await.into_values().filter(|ok| !ok).count();
                if unhealthy > 0 {
                    warn!("{} capabilities failed their health check", unhealthy);
                }
            }
        });
    }

    server::run_server(dispatcher, &settings.bind_addr).await
}
