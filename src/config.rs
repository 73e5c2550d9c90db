//! Process configuration
//!
//! [`Settings`] is a plain serde struct read from YAML or JSON. Every field
//! has a default, so an empty file (or no file) is a valid configuration.
//! Environment overrides are applied by the caller through
//! [`Settings::apply_overrides`]; nothing in here reads the environment.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::{ModelFactory, OllamaConnector, OpenAIConnector};
use crate::orchestrator::{
    Checkpointer, DispatcherConfig, EngineConfig, JsonFileCheckpointer, MemoryCheckpointer, SuspendedSessionPolicy,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub graph_path: PathBuf,
    pub plugin_dir: PathBuf,
    /// Sessions are checkpointed in memory when unset.
    pub checkpoint_dir: Option<PathBuf>,
    pub default_provider: String,
    pub default_model: String,
    pub providers: BTreeMap<String, ProviderSettings>,
    pub session_ttl_secs: u64,
    pub suspended_policy: SuspendedSessionPolicy,
    pub max_steps: usize,
    pub max_commit_attempts: usize,
    pub max_concurrent_sessions: usize,
    pub bind_addr: String,
    pub expiry_interval_secs: u64,
    /// Zero disables periodic capability health checks.
    pub health_check_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            graph_path: PathBuf::from("config/graph.yaml"),
            plugin_dir: PathBuf::from("plugins"),
            checkpoint_dir: None,
            default_provider: "ollama".to_string(),
            default_model: "llama3.2".to_string(),
            providers: BTreeMap::new(),
            session_ttl_secs: 1800,
            suspended_policy: SuspendedSessionPolicy::Expire,
            max_steps: 16,
            max_commit_attempts: 5,
            max_concurrent_sessions: 64,
            bind_addr: "0.0.0.0:8002".to_string(),
            expiry_interval_secs: 60,
            health_check_interval_secs: 300,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read settings at {:?}", path))?;
        let settings = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse settings at {:?}", path))?,
            _ => serde_yaml::from_str::<Option<Settings>>(&content)
                .with_context(|| format!("Failed to parse settings at {:?}", path))?
                .unwrap_or_default(),
        };
        Ok(settings)
    }

    /// Apply `ECHO_BIND_ADDR` and `<PROVIDER>_API_KEY` style overrides from
    /// `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("ECHO_BIND_ADDR") {
            self.bind_addr = addr;
        }
        for provider in ["ollama", "openai"] {
            self.providers.entry(provider.to_string()).or_default();
        }
        for (name, provider) in self.providers.iter_mut() {
            let key = format!("{}_API_KEY", name.to_ascii_uppercase());
            if let Some(api_key) = lookup(&key) {
                provider.api_key = Some(api_key);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            bail!("max_steps must be at least 1");
        }
        if self.max_commit_attempts == 0 {
            bail!("max_commit_attempts must be at least 1");
        }
        if self.max_concurrent_sessions == 0 {
            bail!("max_concurrent_sessions must be at least 1");
        }
        self.bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("bind_addr '{}' is not a socket address", self.bind_addr))?;
        Ok(())
    }

    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0).then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            engine: EngineConfig {
                max_steps: self.max_steps,
                max_commit_attempts: self.max_commit_attempts,
            },
            max_concurrent_sessions: self.max_concurrent_sessions,
        }
    }

    pub fn checkpointer(&self) -> Arc<dyn Checkpointer> {
        match &self.checkpoint_dir {
            Some(dir) => Arc::new(JsonFileCheckpointer::new(dir.clone())),
            None => Arc::new(MemoryCheckpointer::new()),
        }
    }

    /// Model factory with the built-in connectors configured from `providers`.
    pub fn model_factory(&self) -> ModelFactory {
        let ollama = self.provider("ollama");
        let openai = self.provider("openai");
        ModelFactory::new()
            .with_connector(Arc::new(OllamaConnector::new(ollama.base_url)))
            .with_connector(Arc::new(OpenAIConnector::new(openai.base_url, openai.api_key)))
    }
}
