//! Dispatch Facade
//!
//! The single entry point for a turn: load or create the session, feed the
//! input to the engine, and report what happened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex as TurnLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::engine::{EngineConfig, ExecutionEngine, RunReport, StepOutput};
use super::graph::Graph;
use super::session::{Session, SessionStatus, SessionStore};
use crate::agent::ModelFactory;
use crate::emit_event;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::event_bus::DispatchEvent;
use crate::plugins::CapabilityRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub engine: EngineConfig,
    /// Sessions driven at the same time; further submits wait for a permit.
    pub max_concurrent_sessions: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            max_concurrent_sessions: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    /// Step outputs of this submit, separated by blank lines.
    pub output: String,
    pub outputs: Vec<StepOutput>,
    pub revision: u64,
    pub steps: usize,
}

impl From<RunReport> for DispatchOutcome {
    fn from(report: RunReport) -> Self {
        let output = report
            .outputs
            .iter()
            .map(|step| step.output.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Self {
            session_id: report.session.id,
            status: report.session.status,
            output,
            outputs: report.outputs,
            revision: report.session.revision,
            steps: report.steps,
        }
    }
}

pub struct Dispatcher {
    engine: ExecutionEngine,
    store: Arc<SessionStore>,
    registry: Arc<CapabilityRegistry>,
    factory: Arc<ModelFactory>,
    permits: Semaphore,
    /// One lock per session with a submit in flight; turns of a session run
    /// one after another.
    turns: Mutex<HashMap<String, Arc<TurnLock<()>>>>,
}

impl Dispatcher {
    pub fn new(
        graph: Arc<Graph>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<SessionStore>,
        factory: Arc<ModelFactory>,
        config: DispatcherConfig,
    ) -> Self {
        let engine = ExecutionEngine::new(graph, registry.clone(), store.clone(), config.engine);
        Self {
            engine,
            store,
            registry,
            factory,
            permits: Semaphore::new(config.max_concurrent_sessions.max(1)),
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<ModelFactory> {
        &self.factory
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn graph(&self) -> &Graph {
        self.engine.graph()
    }

    /// Load a session from memory or its checkpoint, creating it at the
    /// graph entry if neither has it.
    pub async fn open(&self, session_id: &str) -> OrchestratorResult<Session> {
        if session_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("session id must not be empty".into()));
        }
        if let Some(session) = self.store.restore(session_id).await? {
            return Ok(session);
        }
        match self.store.create(session_id, self.engine.graph().entry()) {
            Ok(session) => Ok(session),
            // Lost a creation race; the winner's session is just as good.
            Err(OrchestratorError::AlreadyExists(_)) => self.store.get(session_id),
            Err(e) => Err(e),
        }
    }

    fn turn_lock(&self, session_id: &str) -> Arc<TurnLock<()>> {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Forget the session's lock once nobody else is queued on it.
    fn release_turn_lock(&self, session_id: &str) {
        let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
        if turns.get(session_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            turns.remove(session_id);
        }
    }

    /// Process one turn for `session_id`. Turns for the same session are
    /// queued and run in arrival order.
    pub async fn submit(&self, session_id: &str, input: &str) -> OrchestratorResult<DispatchOutcome> {
        let lock = self.turn_lock(session_id);
        let outcome = {
            let _turn = lock.lock().await;
            self.run_turn(session_id, input).await
        };
        drop(lock);
        self.release_turn_lock(session_id);
        outcome
    }

    async fn run_turn(&self, session_id: &str, input: &str) -> OrchestratorResult<DispatchOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| OrchestratorError::Internal("dispatcher is shut down".into()))?;

        let session = self.open(session_id).await?;
        debug!(
            "Submitting to session {} at '{}' (revision {})",
            session_id, session.current_node, session.revision
        );

        let input = Some(input.trim()).filter(|s| !s.is_empty()).map(str::to_string);
        let report = self.engine.run(session_id, input).await?;
        Ok(DispatchOutcome::from(report))
    }

    /// Read a session snapshot, restoring it from its checkpoint if needed.
    pub async fn session(&self, session_id: &str) -> OrchestratorResult<Session> {
        self.store
            .restore(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("session", session_id))
    }

    pub async fn expire_idle(&self) -> Vec<String> {
        let expired = self.store.expire_idle(Utc::now()).await;
        for session_id in &expired {
            emit_event!(DispatchEvent::SessionExpired {
                session_id: session_id.clone(),
            });
        }
        if !expired.is_empty() {
            info!("Expired {} idle sessions", expired.len());
        }
        expired
    }

    /// Sweep idle sessions every `every` until the returned handle is aborted.
    pub fn spawn_expiry_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                dispatcher.expire_idle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::checkpoint::{Checkpointer, MemoryCheckpointer};
    use crate::orchestrator::graph::{Edge, Node};

    fn dispatcher(checkpointer: Arc<dyn Checkpointer>, ttl: Duration) -> Arc<Dispatcher> {
        let graph = Graph::builder("wait")
            .node(Node::human_input("wait"))
            .node(Node::terminal("done"))
            .edge(Edge::new("wait", "done"))
            .build()
            .unwrap();
        Arc::new(Dispatcher::new(
            Arc::new(graph),
            Arc::new(CapabilityRegistry::new()),
            Arc::new(SessionStore::new(checkpointer, ttl)),
            Arc::new(ModelFactory::new()),
            DispatcherConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_open_creates_at_entry() {
        let dispatcher = dispatcher(Arc::new(MemoryCheckpointer::new()), Duration::from_secs(60));
        let session = dispatcher.open("fresh").await.unwrap();
        assert_eq!(session.revision, 0);
        assert_eq!(session.current_node, "wait");

        assert!(matches!(dispatcher.open("  ").await, Err(OrchestratorError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_blank_input_suspends() {
        let dispatcher = dispatcher(Arc::new(MemoryCheckpointer::new()), Duration::from_secs(60));
        let outcome = dispatcher.submit("s1", "   ").await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Suspended);
        assert_eq!(outcome.revision, 1);
        assert!(outcome.output.is_empty());

        let outcome = dispatcher.submit("s1", "ready").await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_session_restores_from_checkpoint() {
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let first = dispatcher(checkpointer.clone(), Duration::from_secs(60));
        first.submit("s1", "").await.unwrap();

        let second = dispatcher(checkpointer, Duration::from_secs(60));
        let restored = second.session("s1").await.unwrap();
        assert_eq!(restored.status, SessionStatus::Suspended);
        assert!(matches!(second.session("nope").await, Err(OrchestratorError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_expire_idle_evicts() {
        let dispatcher = dispatcher(Arc::new(MemoryCheckpointer::new()), Duration::ZERO);
        dispatcher.submit("s1", "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(dispatcher.expire_idle().await, vec!["s1".to_string()]);
        assert!(matches!(dispatcher.session("s1").await, Err(OrchestratorError::NotFound { .. })));
    }
}
