//! Checkpointers - durable sinks for session snapshots
//!
//! The JSON checkpointer keeps one pretty-printed file per session so
//! conversations survive process restarts.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

use super::session::Session;
use crate::error::{OrchestratorError, OrchestratorResult};

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, session: &Session) -> OrchestratorResult<()>;
    async fn load(&self, session_id: &str) -> OrchestratorResult<Option<Session>>;
    async fn remove(&self, session_id: &str) -> OrchestratorResult<()>;
}

/// Keeps checkpoints in process memory. Used when no checkpoint directory is
/// configured, and in tests.
#[derive(Default)]
pub struct MemoryCheckpointer {
    snapshots: RwLock<HashMap<String, Session>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, session: &Session) -> OrchestratorResult<()> {
        let mut snapshots = self.snapshots.write().await;
        // Never let an older snapshot overwrite a newer one.
        let stale = snapshots
            .get(&session.id)
            .is_some_and(|existing| existing.revision > session.revision);
        if !stale {
            snapshots.insert(session.id.clone(), session.clone());
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> OrchestratorResult<Option<Session>> {
        Ok(self.snapshots.read().await.get(session_id).cloned())
    }

    async fn remove(&self, session_id: &str) -> OrchestratorResult<()> {
        self.snapshots.write().await.remove(session_id);
        Ok(())
    }
}

pub struct JsonFileCheckpointer {
    dir: PathBuf,
}

impl JsonFileCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Session ids are opaque, so they are hex-encoded into file names.
    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(session_id)))
    }
}

#[async_trait]
impl Checkpointer for JsonFileCheckpointer {
    async fn save(&self, session: &Session) -> OrchestratorResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(session)?;

        let path = self.path_for(&session.id);
        let tmp = path.with_extension(format!("json.{}.tmp", session.revision));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> OrchestratorResult<Option<Session>> {
        let path = self.path_for(session_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).await?;
        let session = serde_json::from_str(&json).map_err(|e| {
            OrchestratorError::Internal(format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(session))
    }

    async fn remove(&self, session_id: &str) -> OrchestratorResult<()> {
        let path = self.path_for(session_id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
