//! Built-in capabilities constructed from descriptor `config` blocks.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::discovery::{CapabilityDescriptor, PluginContext};
use super::{Capability, CapabilityKind, CapabilityOutput};
use crate::agent::{truncate, ModelFactory, ModelParameters};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::session::{Session, StateMutation};

const DEFAULT_HISTORY_TURNS: usize = 10;

/// Substitute `{input}` and `{var:NAME}` placeholders. Missing variables
/// render as empty strings; non-string values render as JSON.
pub(crate) fn render(template: &str, session: &Session, input: Option<&str>) -> String {
    let text = template.replace("{input}", input.unwrap_or(""));

    let mut rendered = String::with_capacity(text.len());
    let mut rest = text.as_str();
    while let Some(start) = rest.find("{var:") {
        let after = &rest[start + 5..];
        let Some(end) = after.find('}') else {
            break;
        };
        rendered.push_str(&rest[..start]);
        match session.variable(&after[..end]) {
            Some(Value::String(s)) => rendered.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => rendered.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);
    rendered
}

/// `config.set` as a list of variable mutations.
fn set_mutations(descriptor: &CapabilityDescriptor) -> Result<Vec<StateMutation>> {
    match descriptor.config_value("set") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(key, value)| StateMutation::set(key.clone(), value.clone()))
            .collect()),
        Some(_) => bail!("{}: config.set must be a map", descriptor.name),
    }
}

struct Identity {
    name: String,
    version: String,
    description: String,
    labels: Vec<String>,
}

impl Identity {
    fn from_descriptor(descriptor: &CapabilityDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            labels: descriptor.capabilities.clone(),
        }
    }
}

/// Completes through the model factory with the session history as prompt.
pub struct LlmAgentCapability {
    identity: Identity,
    factory: Arc<ModelFactory>,
    provider: String,
    model: String,
    parameters: ModelParameters,
    instruction: Option<String>,
    output_key: Option<String>,
    history_turns: usize,
}

impl LlmAgentCapability {
    pub fn from_descriptor(descriptor: &CapabilityDescriptor, context: &PluginContext) -> Result<Self> {
        let spec = descriptor.model.clone().unwrap_or_default();
        let history_turns = descriptor
            .config_value("history_turns")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_HISTORY_TURNS);

        Ok(Self {
            identity: Identity::from_descriptor(descriptor),
            factory: context.factory.clone(),
            provider: spec.provider.unwrap_or_else(|| context.default_provider.clone()),
            model: spec.name.unwrap_or_else(|| context.default_model.clone()),
            parameters: spec.parameters,
            instruction: descriptor.config_str("instruction").map(str::to_string),
            output_key: descriptor.config_str("output_key").map(str::to_string),
            history_turns,
        })
    }
}

#[async_trait]
impl Capability for LlmAgentCapability {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn version(&self) -> &str {
        &self.identity.version
    }

    fn description(&self) -> &str {
        &self.identity.description
    }

    fn labels(&self) -> Vec<String> {
        self.identity.labels.clone()
    }

    /// Warms the model handle so bad provider config fails activation.
    async fn initialize(&self) -> OrchestratorResult<()> {
        self.factory.get(&self.provider, &self.model, &self.parameters).await?;
        Ok(())
    }

    async fn invoke(&self, session: &Session, input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        let handle = self.factory.get(&self.provider, &self.model, &self.parameters).await?;

        let history = session.format_history(self.history_turns);
        let prompt = if history.is_empty() {
            input.unwrap_or_default().to_string()
        } else {
            history
        };
        let system = self
            .instruction
            .as_deref()
            .map(|instruction| render(instruction, session, input));

        debug!("{} prompting {}: {}", self.identity.name, handle.key(), truncate(&prompt, 120));
        let reply = handle
            .complete(prompt, system)
            .await
            .map_err(|e| OrchestratorError::capability(&self.identity.name, e))?;

        let mut output = CapabilityOutput::text(reply.trim());
        if let Some(key) = &self.output_key {
            let value = output.output.clone();
            output = output.set(key.clone(), value);
        }
        Ok(output)
    }
}

/// Replies with a fixed template and sets fixed variables.
pub struct StaticReplyCapability {
    identity: Identity,
    reply: String,
    set: Vec<StateMutation>,
}

impl StaticReplyCapability {
    pub fn from_descriptor(descriptor: &CapabilityDescriptor) -> Result<Self> {
        let Some(reply) = descriptor.config_str("reply") else {
            bail!("{}: static_reply needs config.reply", descriptor.name);
        };
        Ok(Self {
            identity: Identity::from_descriptor(descriptor),
            reply: reply.to_string(),
            set: set_mutations(descriptor)?,
        })
    }
}

#[async_trait]
impl Capability for StaticReplyCapability {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn version(&self) -> &str {
        &self.identity.version
    }

    fn description(&self) -> &str {
        &self.identity.description
    }

    fn labels(&self) -> Vec<String> {
        self.identity.labels.clone()
    }

    async fn invoke(&self, session: &Session, input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        Ok(CapabilityOutput {
            output: render(&self.reply, session, input),
            mutations: self.set.clone(),
        })
    }
}

/// Tool that records variables, optionally capturing the input.
pub struct SetVariablesCapability {
    identity: Identity,
    set: Vec<StateMutation>,
    input_key: Option<String>,
}

impl SetVariablesCapability {
    pub fn from_descriptor(descriptor: &CapabilityDescriptor) -> Result<Self> {
        Ok(Self {
            identity: Identity::from_descriptor(descriptor),
            set: set_mutations(descriptor)?,
            input_key: descriptor.config_str("input_key").map(str::to_string),
        })
    }
}

#[async_trait]
impl Capability for SetVariablesCapability {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn version(&self) -> &str {
        &self.identity.version
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Tool
    }

    fn description(&self) -> &str {
        &self.identity.description
    }

    fn labels(&self) -> Vec<String> {
        self.identity.labels.clone()
    }

    async fn invoke(&self, _session: &Session, input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        let mut output = CapabilityOutput {
            output: String::new(),
            mutations: self.set.clone(),
        };
        if let (Some(key), Some(input)) = (&self.input_key, input) {
            output = output.set(key.clone(), input.trim());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{LLMProvider, ProviderConnector};
    use serde_json::json;

    struct UpperProvider;

    #[async_trait]
    impl LLMProvider for UpperProvider {
        async fn generate(&self, _model: &str, prompt: String, system: Option<String>) -> anyhow::Result<String> {
            Ok(format!("[{}] {}", system.unwrap_or_default(), prompt.to_uppercase()))
        }
    }

    struct UpperConnector;

    #[async_trait]
    impl ProviderConnector for UpperConnector {
        fn provider_id(&self) -> &str {
            "upper"
        }
        async fn connect(&self, _model: &str, _parameters: &ModelParameters) -> anyhow::Result<Arc<dyn LLMProvider>> {
            Ok(Arc::new(UpperProvider))
        }
    }

    fn session_with_name() -> Session {
        let mut session = Session::new("s1", "greet");
        session.apply(&StateMutation::set("name", "Ada")).unwrap();
        session.apply(&StateMutation::set("visits", 3)).unwrap();
        session
    }

    #[test]
    fn test_render_placeholders() {
        let session = session_with_name();
        assert_eq!(
            render("Hi {var:name}, visit {var:visits}. You said: {input}{var:absent}", &session, Some("yo")),
            "Hi Ada, visit 3. You said: yo"
        );
        assert_eq!(render("unterminated {var:name", &session, None), "unterminated {var:name");
    }

    #[tokio::test]
    async fn test_static_reply_sets_variables() {
        let descriptor = CapabilityDescriptor::new("greeter", "1.0.0", "static_reply")
            .with_config(json!({"reply": "Hello, {var:name}!", "set": {"greeted": true}}));
        let capability = StaticReplyCapability::from_descriptor(&descriptor).unwrap();

        let output = capability.invoke(&session_with_name(), None).await.unwrap();
        assert_eq!(output.output, "Hello, Ada!");
        assert_eq!(output.mutations, vec![StateMutation::set("greeted", true)]);
    }

    #[test]
    fn test_static_reply_requires_reply() {
        let descriptor = CapabilityDescriptor::new("greeter", "1.0.0", "static_reply");
        assert!(StaticReplyCapability::from_descriptor(&descriptor).is_err());
    }

    #[tokio::test]
    async fn test_set_variables_captures_input() {
        let descriptor = CapabilityDescriptor::new("capture", "1.0.0", "set_variables")
            .with_config(json!({"input_key": "name", "set": {"has_name": true}}));
        let capability = SetVariablesCapability::from_descriptor(&descriptor).unwrap();
        assert_eq!(capability.kind(), CapabilityKind::Tool);

        let output = capability.invoke(&Session::new("s1", "ask"), Some("  Ada ")).await.unwrap();
        assert!(output.output.is_empty());
        assert_eq!(
            output.mutations,
            vec![StateMutation::set("has_name", true), StateMutation::set("name", "Ada")]
        );
    }

    #[tokio::test]
    async fn test_llm_agent_completes_through_factory() {
        let factory = Arc::new(ModelFactory::new().with_connector(Arc::new(UpperConnector)));
        let context = PluginContext::new(factory.clone(), "upper", "tiny");
        let descriptor = CapabilityDescriptor::new("writer", "1.0.0", "llm_agent")
            .with_config(json!({"instruction": "Address {var:name}", "output_key": "draft"}));
        let capability = LlmAgentCapability::from_descriptor(&descriptor, &context).unwrap();

        capability.initialize().await.unwrap();
        assert_eq!(factory.cached_len(), 1);

        let mut session = session_with_name();
        session.apply(&StateMutation::user("hello")).unwrap();
        let output = capability.invoke(&session, Some("hello")).await.unwrap();
        assert_eq!(output.output, "[Address Ada] USER: HELLO");
        assert_eq!(output.mutations, vec![StateMutation::set("draft", "[Address Ada] USER: HELLO")]);
    }

    #[tokio::test]
    async fn test_llm_agent_unknown_provider_fails_activation() {
        let context = PluginContext::new(Arc::new(ModelFactory::new()), "nowhere", "tiny");
        let descriptor = CapabilityDescriptor::new("writer", "1.0.0", "llm_agent");
        let capability = LlmAgentCapability::from_descriptor(&descriptor, &context).unwrap();
        assert!(matches!(
            capability.initialize().await,
            Err(OrchestratorError::ProviderConfig(_))
        ));
    }
}
