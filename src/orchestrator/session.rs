//! Session Store - per-conversation state with optimistic concurrency
//!
//! Sessions are copied out as snapshots, changed as data
//! ([`StateMutation`]s), and written back with a revision check. The map lock
//! is only held to find or insert a session's slot; the revision check and
//! the apply run under that session's own lock, with nothing awaited inside,
//! so unrelated sessions never contend and a write is all-or-nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::checkpoint::Checkpointer;
use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// Halted on a human-input node until the next turn arrives.
    Suspended,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Suspended => write!(f, "suspended"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single conversation turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Graph node that produced the turn, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Whether suspended sessions are subject to idle eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendedSessionPolicy {
    /// Same idle TTL as every other session.
    #[default]
    Expire,
    /// Never idle-evicted while suspended.
    Retain,
}

/// A proposed change to a session, applied in order by [`SessionStore::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateMutation {
    SetVariable { key: String, value: Value },
    RemoveVariable { key: String },
    AppendTurn {
        role: Role,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<String>,
    },
    SetCurrentNode { node: String },
    SetStatus { status: SessionStatus },
}

impl StateMutation {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::SetVariable {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::RemoveVariable { key: key.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::AppendTurn {
            role: Role::User,
            content: content.into(),
            node: None,
        }
    }

    pub fn assistant(content: impl Into<String>, node: impl Into<String>) -> Self {
        Self::AppendTurn {
            role: Role::Assistant,
            content: content.into(),
            node: Some(node.into()),
        }
    }
}

/// Persistent state of one multi-turn interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
    pub variables: BTreeMap<String, Value>,
    pub current_node: String,
    pub status: SessionStatus,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            turns: Vec::new(),
            variables: BTreeMap::new(),
            current_node: entry_node.into(),
            status: SessionStatus::Active,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn latest_user_input(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
    }

    /// Format the most recent `limit` turns for prompt injection.
    pub fn format_history(&self, limit: usize) -> String {
        let skip = self.turns.len().saturating_sub(limit);
        self.turns
            .iter()
            .skip(skip)
            .map(|turn| {
                let role = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                    Role::System => "System",
                    Role::Tool => "Tool",
                };
                format!("{}: {}", role, turn.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Apply one mutation in place. Does not touch the revision.
    pub fn apply(&mut self, mutation: &StateMutation) -> OrchestratorResult<()> {
        match mutation {
            StateMutation::SetVariable { key, value } => {
                if key.trim().is_empty() {
                    return Err(OrchestratorError::InvalidInput("variable key must not be empty".into()));
                }
                self.variables.insert(key.clone(), value.clone());
            }
            StateMutation::RemoveVariable { key } => {
                self.variables.remove(key);
            }
            StateMutation::AppendTurn { role, content, node } => {
                self.turns.push(Turn {
                    role: *role,
                    content: content.clone(),
                    timestamp: Utc::now(),
                    node: node.clone(),
                });
            }
            StateMutation::SetCurrentNode { node } => {
                if node.trim().is_empty() {
                    return Err(OrchestratorError::InvalidInput("current node must not be empty".into()));
                }
                self.current_node = node.clone();
            }
            StateMutation::SetStatus { status } => {
                self.status = *status;
            }
        }
        Ok(())
    }

    pub fn apply_all(&mut self, mutations: &[StateMutation]) -> OrchestratorResult<()> {
        mutations.iter().try_for_each(|mutation| self.apply(mutation))
    }

    fn is_idle(&self, now: DateTime<Utc>, ttl: Duration, policy: SuspendedSessionPolicy) -> bool {
        if self.status == SessionStatus::Suspended && policy == SuspendedSessionPolicy::Retain {
            return false;
        }
        let idle = now.signed_duration_since(self.updated_at);
        idle.to_std().map(|idle| idle > ttl).unwrap_or(false)
    }
}

struct SessionSlot {
    session: Session,
    /// Set when the slot leaves the map; late writers holding the slot fail.
    evicted: bool,
}

type SharedSlot = Arc<Mutex<SessionSlot>>;

pub struct SessionStore {
    sessions: RwLock<HashMap<String, SharedSlot>>,
    checkpointer: Arc<dyn Checkpointer>,
    ttl: Duration,
    suspended_policy: SuspendedSessionPolicy,
}

impl SessionStore {
    pub fn new(checkpointer: Arc<dyn Checkpointer>, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            checkpointer,
            ttl,
            suspended_policy: SuspendedSessionPolicy::default(),
        }
    }

    pub fn with_suspended_policy(mut self, policy: SuspendedSessionPolicy) -> Self {
        self.suspended_policy = policy;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, session_id: &str) -> OrchestratorResult<SharedSlot> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("session", session_id))
    }

    /// Create a session at revision 0 pointing at `entry_node`.
    pub fn create(&self, session_id: &str, entry_node: &str) -> OrchestratorResult<Session> {
        if session_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("session id must not be empty".into()));
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(session_id) {
            return Err(OrchestratorError::AlreadyExists(session_id.to_string()));
        }
        let session = Session::new(session_id, entry_node);
        sessions.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(SessionSlot {
                session: session.clone(),
                evicted: false,
            })),
        );
        info!("Created session {} at node '{}'", session_id, entry_node);
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> OrchestratorResult<Session> {
        let slot = self.slot(session_id)?;
        let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.evicted {
            return Err(OrchestratorError::not_found("session", session_id));
        }
        Ok(slot.session.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Optimistic write: applies every mutation and bumps the revision by one,
    /// or changes nothing.
    pub fn update(
        &self,
        session_id: &str,
        mutations: &[StateMutation],
        expected_revision: u64,
    ) -> OrchestratorResult<Session> {
        let slot = self.slot(session_id)?;
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.evicted {
            return Err(OrchestratorError::not_found("session", session_id));
        }
        if slot.session.revision != expected_revision {
            return Err(OrchestratorError::RevisionConflict {
                session_id: session_id.to_string(),
                expected: expected_revision,
                actual: slot.session.revision,
            });
        }

        let mut next = slot.session.clone();
        next.apply_all(mutations)?;
        next.revision += 1;
        next.updated_at = Utc::now();
        slot.session = next.clone();
        Ok(next)
    }

    /// Evict a session. Later `get`s fail with `NotFound`; its checkpoint is
    /// removed so it cannot be restored either.
    pub async fn expire(&self, session_id: &str) -> OrchestratorResult<Session> {
        self.evict(session_id, |_| true)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("session", session_id))
    }

    /// Evict `session_id` if `should_evict` holds for its state at the moment
    /// of eviction. Returns `None` when the predicate declined.
    async fn evict<P>(&self, session_id: &str, should_evict: P) -> OrchestratorResult<Option<Session>>
    where
        P: FnOnce(&Session) -> bool,
    {
        let snapshot = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let shared = sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::not_found("session", session_id))?;
            let mut slot = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if !should_evict(&slot.session) {
                return Ok(None);
            }
            slot.evicted = true;
            slot.session.status = SessionStatus::Completed;
            sessions.remove(session_id);
            slot.session.clone()
        };

        if let Err(e) = self.checkpointer.remove(session_id).await {
            warn!("Failed to drop checkpoint for expired session {}: {}", session_id, e);
        }
        info!("Expired session {} at revision {}", session_id, snapshot.revision);
        Ok(Some(snapshot))
    }

    /// Evict every session idle for longer than the TTL. Idleness is checked
    /// again under the session's lock, so a commit racing the sweep keeps
    /// the session alive.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions
                .iter()
                .filter(|(_, slot)| {
                    let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    slot.session.is_idle(now, self.ttl, self.suspended_policy)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut expired = Vec::new();
        for id in candidates {
            let still_idle = |session: &Session| session.is_idle(now, self.ttl, self.suspended_policy);
            if let Ok(Some(_)) = self.evict(&id, still_idle).await {
                expired.push(id);
            }
        }
        expired
    }

    /// Persist the current snapshot through the checkpointer.
    pub async fn checkpoint(&self, session_id: &str) -> OrchestratorResult<()> {
        let snapshot = self.get(session_id)?;
        self.checkpointer.save(&snapshot).await
    }

    /// Bring a checkpointed session back into memory if it is not loaded.
    pub async fn restore(&self, session_id: &str) -> OrchestratorResult<Option<Session>> {
        if let Ok(session) = self.get(session_id) {
            return Ok(Some(session));
        }
        let Some(session) = self.checkpointer.load(session_id).await? else {
            return Ok(None);
        };

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        // Someone may have created it while we were reading the checkpoint.
        if let Some(existing) = sessions.get(session_id) {
            let existing = existing.lock().unwrap_or_else(PoisonError::into_inner);
            return Ok(Some(existing.session.clone()));
        }
        sessions.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(SessionSlot {
                session: session.clone(),
                evicted: false,
            })),
        );
        info!("Restored session {} at revision {}", session_id, session.revision);
        Ok(Some(session))
    }
}
