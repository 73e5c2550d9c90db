//! Execution Graph Engine
//!
//! Drives one session through the graph until it completes, suspends on a
//! human-input node, fails, or runs out of step budget.
//!
//! A step works on a *view*: the stored snapshot plus whatever the step is
//! about to commit (resume bookkeeping, the pending user turn). The
//! capability sees that view read-only and proposes mutations; the engine
//! then writes everything the step produced as one revision. Nothing is
//! locked while a capability runs, so a concurrent writer can move the
//! revision on; the commit is then rebuilt on the fresh snapshot and retried.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::graph::{Graph, NodeKind};
use super::session::{Session, SessionStatus, SessionStore, StateMutation};
use crate::agent::truncate;
use crate::emit_event;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::event_bus::DispatchEvent;
use crate::plugins::{CapabilityOutput, CapabilityRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capability-invoking steps allowed per run.
    pub max_steps: usize,
    pub max_commit_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 16,
            max_commit_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutput {
    pub node: String,
    pub output: String,
}

/// Result of driving a session to a halt.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session: Session,
    /// Non-empty outputs in step order.
    pub outputs: Vec<StepOutput>,
    pub steps: usize,
}

pub struct ExecutionEngine {
    graph: Arc<Graph>,
    registry: Arc<CapabilityRegistry>,
    store: Arc<SessionStore>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        graph: Arc<Graph>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<SessionStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            graph,
            registry,
            store,
            config,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Mutations that bring a halted session back into the running state.
    fn resume_prelude(&self, session: &Session) -> Vec<StateMutation> {
        match session.status {
            SessionStatus::Active => Vec::new(),
            SessionStatus::Suspended | SessionStatus::Failed => vec![StateMutation::SetStatus {
                status: SessionStatus::Active,
            }],
            SessionStatus::Completed => vec![
                StateMutation::SetStatus {
                    status: SessionStatus::Active,
                },
                StateMutation::SetCurrentNode {
                    node: self.graph.entry().to_string(),
                },
            ],
        }
    }

    fn leading_mutations(&self, base: &Session, pending: Option<&str>) -> Vec<StateMutation> {
        let mut mutations = self.resume_prelude(base);
        if let Some(input) = pending {
            mutations.push(StateMutation::user(input));
        }
        mutations
    }

    /// Write one revision built from the latest snapshot, rebuilding and
    /// retrying on revision conflicts.
    ///
    /// Returns `None` when a concurrent writer moved the session to another
    /// node or status: the step was computed for a position the session has
    /// left, so it must not be written at all.
    fn commit<F>(&self, session_id: &str, mut base: Session, build: F) -> OrchestratorResult<Option<Session>>
    where
        F: Fn(&Session) -> OrchestratorResult<Vec<StateMutation>>,
    {
        let attempts = self.config.max_commit_attempts.max(1);
        for attempt in 1..=attempts {
            let mutations = build(&base)?;
            match self.store.update(session_id, &mutations, base.revision) {
                Ok(committed) => return Ok(Some(committed)),
                Err(OrchestratorError::RevisionConflict { actual, .. }) => {
                    debug!(
                        "Commit attempt {}/{} on {} lost the race to revision {}",
                        attempt, attempts, session_id, actual
                    );
                    let fresh = self.store.get(session_id)?;
                    if fresh.current_node != base.current_node || fresh.status != base.status {
                        debug!(
                            "Session {} moved from '{}' to '{}'; dropping the step",
                            session_id, base.current_node, fresh.current_node
                        );
                        return Ok(None);
                    }
                    base = fresh;
                }
                Err(e) => return Err(e),
            }
        }
        Err(OrchestratorError::ConcurrentModification {
            session_id: session_id.to_string(),
            attempts,
        })
    }

    async fn checkpoint(&self, session_id: &str) {
        if let Err(e) = self.store.checkpoint(session_id).await {
            warn!("Checkpoint of session {} failed: {}", session_id, e);
        }
    }

    /// Record the failure in a status-only commit and hand the error back.
    async fn fail(&self, session_id: &str, node: &str, error: OrchestratorError) -> OrchestratorError {
        warn!("Session {} failed at node '{}': {}", session_id, node, error);
        let recorded = self.store.get(session_id).and_then(|base| {
            self.commit(session_id, base, |_| {
                Ok(vec![StateMutation::SetStatus {
                    status: SessionStatus::Failed,
                }])
            })
        });
        match recorded {
            Ok(Some(_)) => self.checkpoint(session_id).await,
            Ok(None) => debug!("Session {} moved on; failure at '{}' not recorded", session_id, node),
            Err(e) => warn!("Could not record failure of session {}: {}", session_id, e),
        }
        emit_event!(DispatchEvent::SessionFailed {
            session_id: session_id.to_string(),
            node: node.to_string(),
            error: error.to_string(),
        });
        error
    }

    /// Drive `session_id` until it halts. `input` is recorded as a user turn
    /// in the first commit of the run.
    pub async fn run(&self, session_id: &str, input: Option<String>) -> OrchestratorResult<RunReport> {
        let mut pending = input;
        let mut outputs = Vec::new();
        let mut steps = 0usize;
        let mut first_pass = true;

        loop {
            let snapshot = self.store.get(session_id)?;
            // Only this run's own start may restart a completed session; a
            // completion seen later was written by another run.
            if !first_pass && snapshot.status == SessionStatus::Completed {
                return Ok(RunReport {
                    session: snapshot,
                    outputs,
                    steps,
                });
            }
            first_pass = false;
            let mut view = snapshot.clone();
            view.apply_all(&self.leading_mutations(&snapshot, pending.as_deref()))?;
            let node_name = view.current_node.clone();

            let Some(node) = self.graph.node(&node_name) else {
                let error = OrchestratorError::InvalidGraph(format!("session is at unknown node '{}'", node_name));
                return Err(self.fail(session_id, &node_name, error).await);
            };

            let halt = match node.kind {
                NodeKind::Terminal => Some(SessionStatus::Completed),
                NodeKind::HumanInputWait if pending.is_none() => Some(SessionStatus::Suspended),
                _ => None,
            };

            if let Some(status) = halt {
                let committed = match self.commit(session_id, snapshot, |base| {
                    let mut mutations = self.leading_mutations(base, pending.as_deref());
                    mutations.push(StateMutation::SetStatus { status });
                    Ok(mutations)
                }) {
                    Ok(Some(committed)) => committed,
                    Ok(None) => continue,
                    Err(e) => return Err(self.fail(session_id, &node_name, e).await),
                };
                self.checkpoint(session_id).await;

                if status == SessionStatus::Completed {
                    info!("Session {} completed at revision {}", session_id, committed.revision);
                    emit_event!(DispatchEvent::SessionCompleted {
                        session_id: session_id.to_string(),
                        revision: committed.revision,
                    });
                } else {
                    info!("Session {} suspended at '{}'", session_id, node_name);
                    emit_event!(DispatchEvent::SessionSuspended {
                        session_id: session_id.to_string(),
                        node: node_name.clone(),
                    });
                }
                return Ok(RunReport {
                    session: committed,
                    outputs,
                    steps,
                });
            }

            if steps >= self.config.max_steps {
                warn!(
                    "Session {} hit the step budget of {} at '{}'",
                    session_id, self.config.max_steps, node_name
                );
                return Err(OrchestratorError::StepBudgetExceeded {
                    session_id: session_id.to_string(),
                    max_steps: self.config.max_steps,
                    output: outputs
                        .iter()
                        .map(|step| step.output.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n"),
                });
            }
            steps += 1;

            debug!("Session {} step {} at '{}'", session_id, steps, node_name);
            emit_event!(DispatchEvent::StepStarted {
                session_id: session_id.to_string(),
                node: node_name.clone(),
            });

            let produced = match &node.capability {
                Some(capability_name) => {
                    let invoked = match self.registry.resolve(capability_name).await {
                        Ok(capability) => {
                            let input = pending.as_deref().or_else(|| view.latest_user_input());
                            capability.invoke(&view, input).await
                        }
                        Err(e) => Err(e),
                    };
                    match invoked {
                        Ok(produced) => produced,
                        Err(e) => return Err(self.fail(session_id, &node_name, e).await),
                    }
                }
                // A wait node without a capability just consumes the input.
                None => CapabilityOutput::empty(),
            };

            let committed = self.commit(session_id, snapshot, |base| {
                let mut mutations = self.leading_mutations(base, pending.as_deref());
                mutations.extend(produced.mutations.iter().cloned());
                if !produced.output.is_empty() {
                    mutations.push(StateMutation::assistant(produced.output.clone(), node_name.clone()));
                }

                let mut after = base.clone();
                after.apply_all(&mutations)?;
                let next = self.graph.route(&node_name, &after)?;
                mutations.push(StateMutation::SetCurrentNode { node: next });
                Ok(mutations)
            });
            let committed = match committed {
                Ok(Some(committed)) => committed,
                // The input, if any, is still pending for wherever the session is now.
                Ok(None) => continue,
                Err(e) => return Err(self.fail(session_id, &node_name, e).await),
            };
            self.checkpoint(session_id).await;

            debug!(
                "Session {} committed revision {} at '{}' -> '{}': {}",
                session_id,
                committed.revision,
                node_name,
                committed.current_node,
                truncate(&produced.output, 80)
            );
            emit_event!(DispatchEvent::StepCommitted {
                session_id: session_id.to_string(),
                node: node_name.clone(),
                revision: committed.revision,
            });

            if !produced.output.is_empty() {
                outputs.push(StepOutput {
                    node: node_name,
                    output: produced.output,
                });
            }
            pending = None;
        }
    }
}
