//! End-to-end dispatch scenarios
//!
//! Drives the public API the way the server does: plugins loaded from
//! descriptor files, a graph loaded from YAML, sessions fed through the
//! dispatcher.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use echo_orchestrator::orchestrator::{
    DispatcherConfig, EngineConfig, Edge, MemoryCheckpointer, Node, SessionStatus,
};
use echo_orchestrator::plugins::{load_plugins, CapabilityState, PluginCatalog, PluginContext};
use echo_orchestrator::{
    Capability, CapabilityOutput, CapabilityRegistry, Dispatcher, Graph, ModelFactory, OrchestratorError,
    OrchestratorResult, Session, SessionStore,
};

const GREETING_GRAPH: &str = r#"
entry: greet
nodes:
  - name: greet
    kind: agent
    capability: greeter
  - name: ask_name
    kind: human_input_wait
    capability: name_capture
  - name: done
    kind: terminal
edges:
  - from: greet
    to: done
    guards:
      - truthy: { var: has_name }
    default: ask_name
  - from: ask_name
    to: greet
"#;

const NAME_CAPTURE: &str = r#"{
    "name": "name_capture",
    "version": "1.0.0",
    "kind": "tool",
    "entry_point": "set_variables",
    "config": { "input_key": "name", "set": { "has_name": true } }
}"#;

/// Asks for a name until one is known, then greets by name.
struct Greeter;

#[async_trait]
impl Capability for Greeter {
    fn name(&self) -> &str {
        "greeter"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn invoke(&self, session: &Session, _input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        Ok(match session.variable("name").and_then(|v| v.as_str()) {
            Some(name) => CapabilityOutput::text(format!("Hello, {}!", name)),
            None => CapabilityOutput::text("Hi! What's your name?"),
        })
    }
}

/// Counts its own invocations.
struct Ticker;

#[async_trait]
impl Capability for Ticker {
    fn name(&self) -> &str {
        "ticker"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn invoke(&self, session: &Session, _input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        let ticks = session.variable("ticks").and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(CapabilityOutput::text(format!("tick {}", ticks + 1)).set("ticks", ticks + 1))
    }
}

/// Never finishes in test time.
struct Sleeper;

#[async_trait]
impl Capability for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn invoke(&self, _session: &Session, _input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(CapabilityOutput::text("finally").set("woke", true))
    }
}

async fn activate(registry: &CapabilityRegistry, capability: Arc<dyn Capability>) -> Result<()> {
    let id = registry.register(capability).await?;
    registry.activate(&id.name, &id.version).await?;
    Ok(())
}

fn dispatcher(graph: Graph, registry: Arc<CapabilityRegistry>, max_steps: usize) -> Dispatcher {
    let store = Arc::new(SessionStore::new(
        Arc::new(MemoryCheckpointer::new()),
        Duration::from_secs(600),
    ));
    Dispatcher::new(
        Arc::new(graph),
        registry,
        store,
        Arc::new(ModelFactory::new()),
        DispatcherConfig {
            engine: EngineConfig {
                max_steps,
                max_commit_attempts: 5,
            },
            max_concurrent_sessions: 8,
        },
    )
}

async fn greeting_dispatcher(dir: &Path) -> Result<Dispatcher> {
    let plugin_dir = dir.join("plugins");
    std::fs::create_dir_all(&plugin_dir)?;
    std::fs::write(plugin_dir.join("name_capture.json"), NAME_CAPTURE)?;
    let graph_path = dir.join("graph.yaml");
    std::fs::write(&graph_path, GREETING_GRAPH)?;

    let registry = Arc::new(CapabilityRegistry::new());
    let context = PluginContext::new(Arc::new(ModelFactory::new()), "ollama", "llama3.2");
    let report = load_plugins(&plugin_dir, &PluginCatalog::with_builtins(), &registry, &context).await?;
    assert_eq!(report.activated, 1);
    activate(&registry, Arc::new(Greeter)).await?;

    let graph = Graph::load(&graph_path)?;
    graph.check_capabilities(&registry).await?;
    Ok(dispatcher(graph, registry, 16))
}

fn cycle_graph() -> Result<Graph> {
    Ok(Graph::builder("a")
        .node(Node::agent("a", "ticker"))
        .node(Node::agent("b", "ticker"))
        .edge(Edge::new("a", "b"))
        .edge(Edge::new("b", "a"))
        .build()?)
}

#[tokio::test]
async fn test_greeting_suspends_then_completes() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let dispatcher = greeting_dispatcher(temp_dir.path()).await?;

    let first = dispatcher.submit("s1", "hi").await?;
    assert_eq!(first.status, SessionStatus::Suspended);
    assert_eq!(first.output, "Hi! What's your name?");
    assert_eq!(first.steps, 1);
    assert_eq!(first.revision, 2);
    assert_eq!(dispatcher.session("s1").await?.current_node, "ask_name");

    let second = dispatcher.submit("s1", "Ada").await?;
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(second.output, "Hello, Ada!");
    assert_eq!(second.steps, 2);
    assert_eq!(second.revision, 5);

    let session = dispatcher.session("s1").await?;
    assert_eq!(session.current_node, "done");
    let contents: Vec<&str> = session.turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["hi", "Hi! What's your name?", "Ada", "Hello, Ada!"]);
    Ok(())
}

#[tokio::test]
async fn test_unknown_session_is_created_at_revision_zero() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let dispatcher = greeting_dispatcher(temp_dir.path()).await?;

    assert!(dispatcher.store().is_empty());
    let session = dispatcher.open("brand-new").await?;
    assert_eq!(session.revision, 0);
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_node, "greet");

    // A submit on another unknown id creates it the same way.
    let outcome = dispatcher.submit("also-new", "hello").await?;
    assert_eq!(outcome.session_id, "also-new");
    assert_eq!(dispatcher.store().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_step_budget_leaves_session_resumable() -> Result<()> {
    let registry = Arc::new(CapabilityRegistry::new());
    activate(&registry, Arc::new(Ticker)).await?;
    let dispatcher = dispatcher(cycle_graph()?, registry, 3);

    let err = dispatcher.submit("loop", "go").await.unwrap_err();
    match &err {
        OrchestratorError::StepBudgetExceeded { max_steps, output, .. } => {
            assert_eq!(*max_steps, 3);
            assert_eq!(output, "tick 1\n\ntick 2\n\ntick 3");
        }
        other => panic!("expected a step budget error, got {:?}", other),
    }

    let session = dispatcher.session("loop").await?;
    assert_eq!(session.revision, 3);
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_node, "b");
    assert_eq!(session.variable("ticks"), Some(&serde_json::json!(3)));

    // The next submit picks up where the budget ran out.
    let err = dispatcher.submit("loop", "again").await.unwrap_err();
    assert_eq!(err.kind(), echo_orchestrator::ErrorKind::StepBudgetExceeded);
    assert_eq!(dispatcher.session("loop").await?.revision, 6);
    Ok(())
}

#[tokio::test]
async fn test_deactivated_capability_fails_the_step() -> Result<()> {
    let registry = Arc::new(CapabilityRegistry::new());
    activate(&registry, Arc::new(Ticker)).await?;
    registry.deactivate("ticker", "1.0.0").await?;

    assert!(matches!(
        registry.resolve("ticker").await,
        Err(OrchestratorError::NotFound { .. })
    ));
    let listing = registry.list().await;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].state, CapabilityState::Inactive);

    let dispatcher = dispatcher(cycle_graph()?, registry.clone(), 3);
    let err = dispatcher.submit("s1", "go").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound { .. }));
    assert_eq!(dispatcher.session("s1").await?.status, SessionStatus::Failed);

    // Reactivating lets the failed session resume at the same node.
    registry.activate("ticker", "1.0.0").await?;
    let err = dispatcher.submit("s1", "go").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StepBudgetExceeded { .. }));
    assert_eq!(dispatcher.session("s1").await?.variable("ticks"), Some(&serde_json::json!(3)));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_submit_leaves_revision_unchanged() -> Result<()> {
    let registry = Arc::new(CapabilityRegistry::new());
    activate(&registry, Arc::new(Sleeper)).await?;
    let graph = Graph::builder("nap")
        .node(Node::agent("nap", "sleeper"))
        .node(Node::terminal("done"))
        .edge(Edge::new("nap", "done"))
        .build()?;
    let dispatcher = dispatcher(graph, registry, 4);

    let before = dispatcher.open("s1").await?;
    let timed_out = tokio::time::timeout(Duration::from_millis(50), dispatcher.submit("s1", "sleep")).await;
    assert!(timed_out.is_err());

    let after = dispatcher.session("s1").await?;
    assert_eq!(after.revision, before.revision);
    assert_eq!(after.status, SessionStatus::Active);
    assert!(after.turns.is_empty());
    assert_eq!(after.variable("woke"), None);
    Ok(())
}

#[tokio::test]
async fn test_graph_rejects_node_without_routing() -> Result<()> {
    let err = Graph::builder("a")
        .node(Node::agent("a", "ticker"))
        .node(Node::terminal("done"))
        .edge(Edge::new("a", "done").when(echo_orchestrator::orchestrator::Guard::truthy("ready")))
        .build()
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidGraph(_)));
    Ok(())
}
