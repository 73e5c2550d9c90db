//! Plugin discovery and loading
//!
//! Descriptor files in the plugin directory name an `entry_point`; the
//! [`PluginCatalog`] turns each descriptor into a live capability which is
//! then registered and activated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::builtin::{LlmAgentCapability, SetVariablesCapability, StaticReplyCapability};
use super::registry::CapabilityRegistry;
use super::script::ScriptCapability;
use super::{Capability, CapabilityKind};
use crate::agent::{ModelFactory, ModelParameters};
use crate::error::OrchestratorError;

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Per-plugin model selection. Unset fields fall back to the process defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, flatten)]
    pub parameters: ModelParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub kind: CapabilityKind,
    pub entry_point: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub model: Option<ModelSpec>,
    #[serde(default)]
    pub config: Value,
    /// Directory the descriptor was read from; relative paths in `config`
    /// resolve against it.
    #[serde(skip)]
    pub source_dir: PathBuf,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind: CapabilityKind::default(),
            entry_point: entry_point.into(),
            description: String::new(),
            capabilities: Vec::new(),
            model: None,
            config: Value::Null,
            source_dir: PathBuf::from("."),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config_value(key).and_then(Value::as_str)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read descriptor at {:?}", path))?;
        let mut descriptor: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse descriptor at {:?}", path))?,
            _ => serde_json::from_str(&content).with_context(|| format!("Failed to parse descriptor at {:?}", path))?,
        };
        descriptor.source_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
        Ok(descriptor)
    }
}

/// What constructors get besides their descriptor.
#[derive(Clone)]
pub struct PluginContext {
    pub factory: Arc<ModelFactory>,
    pub default_provider: String,
    pub default_model: String,
}

impl PluginContext {
    pub fn new(factory: Arc<ModelFactory>, default_provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            factory,
            default_provider: default_provider.into(),
            default_model: default_model.into(),
        }
    }
}

pub type CapabilityConstructor =
    Arc<dyn Fn(&CapabilityDescriptor, &PluginContext) -> Result<Arc<dyn Capability>> + Send + Sync>;

/// Maps `entry_point` strings to capability constructors.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    constructors: HashMap<String, CapabilityConstructor>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with `llm_agent`, `static_reply`, `set_variables`
    /// and `script`.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register("llm_agent", |descriptor, context| {
            Ok(Arc::new(LlmAgentCapability::from_descriptor(descriptor, context)?) as Arc<dyn Capability>)
        });
        catalog.register("static_reply", |descriptor, _| {
            Ok(Arc::new(StaticReplyCapability::from_descriptor(descriptor)?) as Arc<dyn Capability>)
        });
        catalog.register("set_variables", |descriptor, _| {
            Ok(Arc::new(SetVariablesCapability::from_descriptor(descriptor)?) as Arc<dyn Capability>)
        });
        catalog.register("script", |descriptor, _| {
            Ok(Arc::new(ScriptCapability::from_descriptor(descriptor)?) as Arc<dyn Capability>)
        });
        catalog
    }

    pub fn register<F>(&mut self, entry_point: impl Into<String>, constructor: F)
    where
        F: Fn(&CapabilityDescriptor, &PluginContext) -> Result<Arc<dyn Capability>> + Send + Sync + 'static,
    {
        self.constructors.insert(entry_point.into(), Arc::new(constructor));
    }

    pub fn entry_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn construct(&self, descriptor: &CapabilityDescriptor, context: &PluginContext) -> Result<Arc<dyn Capability>> {
        let constructor = self
            .constructors
            .get(&descriptor.entry_point)
            .ok_or_else(|| anyhow!("unknown entry point '{}'", descriptor.entry_point))?;
        constructor(descriptor, context)
    }
}

/// Read every descriptor in `dir`, sorted by name then version. A missing
/// directory yields nothing.
pub fn discover(dir: impl AsRef<Path>) -> Result<Vec<CapabilityDescriptor>> {
    let path = dir.as_ref();
    if !path.exists() {
        debug!("Plugin directory {:?} does not exist", path);
        return Ok(Vec::new());
    }

    let mut descriptors = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let path = entry.path();
        let is_descriptor = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("json") | Some("yaml") | Some("yml")
        );
        if !is_descriptor {
            continue;
        }
        match CapabilityDescriptor::from_file(&path) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => warn!("Skipping plugin descriptor at {:?}: {:#}", path, e),
        }
    }
    descriptors.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    Ok(descriptors)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub discovered: usize,
    pub registered: usize,
    pub activated: usize,
    /// Already registered; left untouched by a reload.
    pub skipped: usize,
    /// `name@version` with the reason it did not load.
    pub failed: Vec<(String, String)>,
}

async fn install(
    descriptors: Vec<CapabilityDescriptor>,
    catalog: &PluginCatalog,
    registry: &CapabilityRegistry,
    context: &PluginContext,
    skip_existing: bool,
) -> LoadReport {
    let mut report = LoadReport {
        discovered: descriptors.len(),
        ..LoadReport::default()
    };

    for descriptor in descriptors {
        let label = format!("{}@{}", descriptor.name, descriptor.version);
        if skip_existing && registry.contains(&descriptor.name, &descriptor.version).await {
            report.skipped += 1;
            continue;
        }

        let capability = match catalog.construct(&descriptor, context) {
            Ok(capability) => capability,
            Err(e) => {
                warn!("Failed to construct plugin {}: {:#}", label, e);
                report.failed.push((label, e.to_string()));
                continue;
            }
        };

        let id = match registry.register(capability).await {
            Ok(id) => id,
            Err(OrchestratorError::DuplicateCapability { .. }) if skip_existing => {
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!("Failed to register plugin {}: {}", label, e);
                report.failed.push((label, e.to_string()));
                continue;
            }
        };
        report.registered += 1;

        match registry.activate(&id.name, &id.version).await {
            Ok(()) => report.activated += 1,
            Err(e) => report.failed.push((label, e.to_string())),
        }
    }
    report
}

/// Discover, construct, register and activate every plugin in `dir`.
/// Individual failures are reported, not fatal.
pub async fn load_plugins(
    dir: impl AsRef<Path>,
    catalog: &PluginCatalog,
    registry: &CapabilityRegistry,
    context: &PluginContext,
) -> Result<LoadReport> {
    let descriptors = discover(&dir)?;
    let report = install(descriptors, catalog, registry, context, false).await;
    info!(
        "Loaded plugins from {:?}: {} activated, {} failed",
        dir.as_ref(),
        report.activated,
        report.failed.len()
    );
    Ok(report)
}

/// Pick up descriptors added since the last load. Entries that are already
/// registered are left alone.
pub async fn reload_plugins(
    dir: impl AsRef<Path>,
    catalog: &PluginCatalog,
    registry: &CapabilityRegistry,
    context: &PluginContext,
) -> Result<LoadReport> {
    let descriptors = discover(&dir)?;
    let report = install(descriptors, catalog, registry, context, true).await;
    info!(
        "Reloaded plugins from {:?}: {} new, {} unchanged",
        dir.as_ref(),
        report.activated,
        report.skipped
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::session::Session;
    use serde_json::json;
    use tempfile::tempdir;

    fn context() -> PluginContext {
        PluginContext::new(Arc::new(ModelFactory::new()), "ollama", "llama3.2")
    }

    fn write(dir: &Path, file: &str, content: &str) {
        std::fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn test_discover_reads_json_and_yaml() {
        let temp_dir = tempdir().unwrap();
        write(
            temp_dir.path(),
            "greeter.json",
            r#"{"name": "greeter", "version": "1.0.0", "entry_point": "static_reply", "config": {"reply": "Hi"}}"#,
        );
        write(
            temp_dir.path(),
            "capture.yaml",
            "name: capture\nkind: tool\nentry_point: set_variables\nconfig:\n  input_key: name\n",
        );
        write(temp_dir.path(), "broken.json", "{ not json");
        write(temp_dir.path(), "README.md", "ignored");

        let descriptors = discover(temp_dir.path()).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].name, "capture");
        assert_eq!(descriptors[0].version, "0.1.0");
        assert_eq!(descriptors[0].kind, CapabilityKind::Tool);
        assert_eq!(descriptors[0].source_dir, temp_dir.path());
        assert_eq!(descriptors[1].config_str("reply"), Some("Hi"));
    }

    #[test]
    fn test_discover_missing_directory() {
        let temp_dir = tempdir().unwrap();
        assert!(discover(temp_dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_descriptor_model_spec_flattens_parameters() {
        let descriptor: CapabilityDescriptor = serde_json::from_value(json!({
            "name": "writer",
            "entry_point": "llm_agent",
            "model": {"provider": "openai", "name": "gpt-4o-mini", "temperature": 0.2}
        }))
        .unwrap();
        let model = descriptor.model.unwrap();
        assert_eq!(model.provider.as_deref(), Some("openai"));
        assert_eq!(model.parameters.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn test_load_and_reload_plugins() {
        let temp_dir = tempdir().unwrap();
        write(
            temp_dir.path(),
            "greeter.json",
            r#"{"name": "greeter", "entry_point": "static_reply", "config": {"reply": "Hello, {input}!"}}"#,
        );
        write(
            temp_dir.path(),
            "mystery.json",
            r#"{"name": "mystery", "entry_point": "does_not_exist"}"#,
        );

        let catalog = PluginCatalog::with_builtins();
        let registry = CapabilityRegistry::new();
        let report = load_plugins(temp_dir.path(), &catalog, &registry, &context()).await.unwrap();
        assert_eq!(report.discovered, 2);
        assert_eq!(report.activated, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "mystery@0.1.0");

        let greeter = registry.resolve("greeter").await.unwrap();
        let output = greeter.invoke(&Session::new("s1", "greet"), Some("Ada")).await.unwrap();
        assert_eq!(output.output, "Hello, Ada!");

        write(
            temp_dir.path(),
            "capture.json",
            r#"{"name": "capture", "kind": "tool", "entry_point": "set_variables", "config": {"set": {"has_name": true}}}"#,
        );
        let report = reload_plugins(temp_dir.path(), &catalog, &registry, &context()).await.unwrap();
        assert_eq!(report.activated, 1);
        assert_eq!(report.skipped, 1);
        assert!(registry.resolve("capture").await.is_ok());
    }

    #[test]
    fn test_catalog_lists_builtins() {
        assert_eq!(
            PluginCatalog::with_builtins().entry_points(),
            vec!["llm_agent", "script", "set_variables", "static_reply"]
        );
    }
}
