//! Capability Registry
//!
//! Entries are keyed by (name, version) and move through
//! `inactive -> active <-> inactive -> unregistered`. Hooks never run under
//! the table lock: activation parks the entry in `activating`, which
//! `resolve` never returns, runs the init hook, then publishes the outcome.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{Capability, CapabilityKind};
use crate::emit_event;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::event_bus::DispatchEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityState {
    Inactive,
    Activating,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityId {
    pub name: String,
    pub version: String,
}

impl CapabilityId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityListing {
    pub name: String,
    pub version: String,
    pub kind: CapabilityKind,
    pub state: CapabilityState,
}

struct Entry {
    capability: Arc<dyn Capability>,
    state: CapabilityState,
}

/// Compare dotted version tags segment by segment: numeric segments
/// numerically, anything else lexically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-', '+']);
    let mut right = b.split(['.', '-', '+']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[derive(Default)]
pub struct CapabilityRegistry {
    entries: Arc<RwLock<HashMap<CapabilityId, Entry>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability in the `inactive` state.
    pub async fn register(&self, capability: Arc<dyn Capability>) -> OrchestratorResult<CapabilityId> {
        let id = CapabilityId::new(capability.name(), capability.version());
        if id.name.trim().is_empty() || id.version.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "capabilities need a non-empty name and version".into(),
            ));
        }

        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(OrchestratorError::DuplicateCapability {
                name: id.name,
                version: id.version,
            });
        }
        entries.insert(
            id.clone(),
            Entry {
                capability,
                state: CapabilityState::Inactive,
            },
        );
        info!("Registered capability {}", id);
        Ok(id)
    }

    /// Remove an inactive capability.
    pub async fn unregister(&self, name: &str, version: &str) -> OrchestratorResult<()> {
        let id = CapabilityId::new(name, version);
        let mut entries = self.entries.write().await;
        let entry = entries
            .get(&id)
            .ok_or_else(|| OrchestratorError::not_found("capability", id.to_string()))?;
        if entry.state != CapabilityState::Inactive {
            return Err(OrchestratorError::InvalidState(format!(
                "capability {} must be inactive before it is unregistered",
                id
            )));
        }
        entries.remove(&id);
        info!("Unregistered capability {}", id);
        Ok(())
    }

    pub async fn activate(&self, name: &str, version: &str) -> OrchestratorResult<()> {
        let id = CapabilityId::new(name, version);
        let capability = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(&id)
                .ok_or_else(|| OrchestratorError::not_found("capability", id.to_string()))?;
            match entry.state {
                CapabilityState::Active => return Ok(()),
                CapabilityState::Activating => {
                    return Err(OrchestratorError::Activation {
                        name: id.name,
                        version: id.version,
                        reason: "activation already in progress".into(),
                    });
                }
                CapabilityState::Inactive => {
                    entry.state = CapabilityState::Activating;
                    entry.capability.clone()
                }
            }
        };

        // The hook runs on its own task, so dropping this future mid-activation
        // still settles the entry.
        let entries = Arc::clone(&self.entries);
        let settle_id = id.clone();
        let settle = tokio::spawn(async move {
            let outcome = capability.initialize().await;
            let mut entries = entries.write().await;
            // Activating entries cannot be unregistered, so the entry is still here.
            if let Some(entry) = entries.get_mut(&settle_id) {
                entry.state = if outcome.is_ok() {
                    CapabilityState::Active
                } else {
                    CapabilityState::Inactive
                };
            }
            outcome
        });

        let outcome = match settle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                if let Some(entry) = self.entries.write().await.get_mut(&id) {
                    entry.state = CapabilityState::Inactive;
                }
                Err(OrchestratorError::Internal(format!("init hook aborted: {}", join_error)))
            }
        };

        match outcome {
            Ok(()) => {
                info!("Activated capability {}", id);
                emit_event!(DispatchEvent::CapabilityActivated {
                    name: id.name,
                    version: id.version,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Activation of {} failed: {}", id, e);
                Err(OrchestratorError::Activation {
                    name: id.name,
                    version: id.version,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Idempotent: deactivating an inactive capability is a no-op.
    pub async fn deactivate(&self, name: &str, version: &str) -> OrchestratorResult<()> {
        let id = CapabilityId::new(name, version);
        let capability = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(&id)
                .ok_or_else(|| OrchestratorError::not_found("capability", id.to_string()))?;
            match entry.state {
                CapabilityState::Inactive => return Ok(()),
                CapabilityState::Activating => {
                    return Err(OrchestratorError::InvalidState(format!(
                        "capability {} is still activating",
                        id
                    )));
                }
                CapabilityState::Active => {
                    entry.state = CapabilityState::Inactive;
                    entry.capability.clone()
                }
            }
        };

        capability.teardown().await;
        info!("Deactivated capability {}", id);
        emit_event!(DispatchEvent::CapabilityDeactivated {
            name: id.name,
            version: id.version,
        });
        Ok(())
    }

    /// Highest-version active capability with this name.
    pub async fn resolve(&self, name: &str) -> OrchestratorResult<Arc<dyn Capability>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(id, entry)| id.name == name && entry.state == CapabilityState::Active)
            .max_by(|(a, _), (b, _)| compare_versions(&a.version, &b.version))
            .map(|(_, entry)| entry.capability.clone())
            .ok_or_else(|| OrchestratorError::not_found("capability", name))
    }

    /// Point-in-time listing, sorted by name then version.
    pub async fn list(&self) -> Vec<CapabilityListing> {
        let entries = self.entries.read().await;
        let mut listing: Vec<CapabilityListing> = entries
            .iter()
            .map(|(id, entry)| CapabilityListing {
                name: id.name.clone(),
                version: id.version.clone(),
                kind: entry.capability.kind(),
                state: entry.state,
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| compare_versions(&a.version, &b.version)));
        listing
    }

    pub async fn names(&self) -> BTreeSet<String> {
        self.entries.read().await.keys().map(|id| id.name.clone()).collect()
    }

    pub async fn contains(&self, name: &str, version: &str) -> bool {
        self.entries.read().await.contains_key(&CapabilityId::new(name, version))
    }

    /// Activate every inactive entry, collecting failures instead of stopping.
    pub async fn activate_all(&self) -> Vec<(CapabilityId, OrchestratorError)> {
        let pending: Vec<CapabilityId> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.state == CapabilityState::Inactive)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut failures = Vec::new();
        for id in pending {
            if let Err(e) = self.activate(&id.name, &id.version).await {
                failures.push((id, e));
            }
        }
        failures
    }

    /// Run every active capability's health hook and deactivate the unhealthy
    /// ones so routing stops reaching them.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let active: Vec<(CapabilityId, Arc<dyn Capability>)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.state == CapabilityState::Active)
                .map(|(id, entry)| (id.clone(), entry.capability.clone()))
                .collect()
        };

        let mut results = BTreeMap::new();
        for (id, capability) in active {
            let healthy = capability.health_check().await;
            if !healthy {
                warn!("Health check failed for {}; deactivating", id);
                if let Err(e) = self.deactivate(&id.name, &id.version).await {
                    warn!("Could not deactivate {}: {}", id, e);
                }
            }
            results.insert(id.to_string(), healthy);
        }
        results
    }

    /// One-line descriptions of active capabilities, for coordinator prompts.
    /// A name with several active versions is described by the one `resolve`
    /// would pick.
    pub async fn routing_info(&self) -> BTreeMap<String, String> {
        let entries = self.entries.read().await;
        let mut chosen: BTreeMap<&str, (&CapabilityId, &Entry)> = BTreeMap::new();
        for (id, entry) in entries.iter().filter(|(_, entry)| entry.state == CapabilityState::Active) {
            let newer = chosen
                .get(id.name.as_str())
                .map_or(true, |(current, _)| compare_versions(&id.version, &current.version) == Ordering::Greater);
            if newer {
                chosen.insert(id.name.as_str(), (id, entry));
            }
        }

        chosen
            .into_iter()
            .map(|(name, (_, entry))| {
                let capability = &entry.capability;
                let labels = capability.labels();
                let info = if labels.is_empty() {
                    capability.description().to_string()
                } else {
                    format!("{}. Capabilities: {}", capability.description(), labels.join(", "))
                };
                (name.to_string(), info)
            })
            .collect()
    }
}
