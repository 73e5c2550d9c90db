//! Plugin System Module
//!
//! Capabilities are the pluggable agents and tools that graph nodes invoke.
//! They are discovered from descriptor files, registered by name and version,
//! and move through an explicit activation lifecycle in the registry.

mod builtin;
mod discovery;
mod registry;
mod script;

pub use builtin::{LlmAgentCapability, SetVariablesCapability, StaticReplyCapability};
pub use discovery::{
    discover, load_plugins, reload_plugins, CapabilityConstructor, CapabilityDescriptor, LoadReport, ModelSpec,
    PluginCatalog, PluginContext,
};
pub use registry::{CapabilityId, CapabilityListing, CapabilityRegistry, CapabilityState};
pub use script::ScriptCapability;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorResult;
use crate::orchestrator::session::{Session, StateMutation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    #[default]
    Agent,
    Tool,
}

/// What a capability hands back: display text plus proposed state changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub mutations: Vec<StateMutation>,
}

impl CapabilityOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            mutations: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_mutation(mut self, mutation: StateMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn set(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_mutation(StateMutation::set(key, value))
    }
}

/// A unit of agent or tool logic.
///
/// `invoke` receives a read-only snapshot; it never writes session state
/// itself. Lifecycle hooks are driven by the registry.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Agent
    }

    fn description(&self) -> &str {
        ""
    }

    /// Short labels advertised to routing prompts.
    fn labels(&self) -> Vec<String> {
        Vec::new()
    }

    async fn initialize(&self) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn teardown(&self) {}

    async fn health_check(&self) -> bool {
        true
    }

    async fn invoke(&self, session: &Session, input: Option<&str>) -> OrchestratorResult<CapabilityOutput>;
}
