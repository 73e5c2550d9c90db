//! Model Factory
//!
//! Hands out one shared [`ModelHandle`] per normalized
//! (provider, model, parameters) key. Construction is single-flight: callers
//! racing on an uncached key all await the same construction future and see
//! the same handle or the same error. Failed constructions are dropped from
//! the cache so the next call retries.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::provider::{LLMProvider, ProviderConnector};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Sampling parameters that distinguish one model configuration from another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional: BTreeMap<String, Value>,
}

impl ModelParameters {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional.insert(key.into(), value.into());
        self
    }

    /// SHA-256 over the canonical JSON form. Map keys serialize sorted, so
    /// insertion order never changes the fingerprint.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelKey {
    pub provider: String,
    pub model: String,
    pub parameters_hash: String,
}

impl ModelKey {
    pub fn new(provider: &str, model: &str, parameters: &ModelParameters) -> Self {
        Self {
            provider: provider.trim().to_ascii_lowercase(),
            model: model.trim().to_ascii_lowercase(),
            parameters_hash: parameters.fingerprint(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.provider, self.model, &self.parameters_hash[..8])
    }
}

/// A reusable completion callable for one model configuration.
pub struct ModelHandle {
    key: ModelKey,
    model: String,
    parameters: ModelParameters,
    provider: Arc<dyn LLMProvider>,
}

impl ModelHandle {
    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    pub async fn complete(&self, prompt: String, system: Option<String>) -> anyhow::Result<String> {
        self.provider.generate(&self.model, prompt, system).await
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle").field("key", &self.key).finish()
    }
}

type Construction = Shared<BoxFuture<'static, OrchestratorResult<Arc<ModelHandle>>>>;

enum SlotState {
    Pending(Construction),
    Ready(Arc<ModelHandle>),
}

struct Slot {
    generation: u64,
    state: SlotState,
}

pub struct ModelFactory {
    connectors: RwLock<HashMap<String, Arc<dyn ProviderConnector>>>,
    slots: Mutex<HashMap<ModelKey, Slot>>,
    next_generation: AtomicU64,
    constructions: Arc<AtomicUsize>,
}

impl ModelFactory {
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            constructions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_connector(self, connector: Arc<dyn ProviderConnector>) -> Self {
        self.register_connector(connector);
        self
    }

    pub fn register_connector(&self, connector: Arc<dyn ProviderConnector>) {
        let id = connector.provider_id().trim().to_ascii_lowercase();
        info!("Registered model provider connector: {}", id);
        self.connectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, connector);
    }

    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn connector(&self, provider: &str) -> OrchestratorResult<Arc<dyn ProviderConnector>> {
        self.connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
            .ok_or_else(|| OrchestratorError::ProviderConfig(format!("unknown provider '{}'", provider)))
    }

    /// Returns the cached handle for the key or constructs it exactly once.
    pub async fn get(
        &self,
        provider: &str,
        model: &str,
        parameters: &ModelParameters,
    ) -> OrchestratorResult<Arc<ModelHandle>> {
        let key = ModelKey::new(provider, model, parameters);

        let (generation, construction) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(&key) {
                Some(Slot {
                    state: SlotState::Ready(handle),
                    ..
                }) => {
                    debug!("Model handle cache hit for {}", key);
                    return Ok(handle.clone());
                }
                Some(Slot {
                    generation,
                    state: SlotState::Pending(construction),
                }) => (*generation, construction.clone()),
                None => {
                    let connector = self.connector(&key.provider)?;
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let construction = Self::construct(
                        connector,
                        key.clone(),
                        key.model.clone(),
                        parameters.clone(),
                        self.constructions.clone(),
                    )
                    .boxed()
                    .shared();
                    slots.insert(
                        key.clone(),
                        Slot {
                            generation,
                            state: SlotState::Pending(construction.clone()),
                        },
                    );
                    (generation, construction)
                }
            }
        };

        let result = construction.await;

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // An invalidation while we were waiting bumps the slot away; leave it.
        let still_current = slots.get(&key).map(|slot| slot.generation) == Some(generation);
        if still_current {
            match &result {
                Ok(handle) => {
                    slots.insert(
                        key,
                        Slot {
                            generation,
                            state: SlotState::Ready(handle.clone()),
                        },
                    );
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }
        result
    }

    async fn construct(
        connector: Arc<dyn ProviderConnector>,
        key: ModelKey,
        model: String,
        parameters: ModelParameters,
        constructions: Arc<AtomicUsize>,
    ) -> OrchestratorResult<Arc<ModelHandle>> {
        constructions.fetch_add(1, Ordering::SeqCst);
        info!("Constructing model handle {}", key);
        match connector.connect(&model, &parameters).await {
            Ok(provider) => Ok(Arc::new(ModelHandle {
                key,
                model,
                parameters,
                provider,
            })),
            Err(e) => {
                warn!("Model handle construction failed for {}: {:#}", key, e);
                Err(OrchestratorError::ProviderConfig(format!("{}: {:#}", key.provider, e)))
            }
        }
    }

    pub fn invalidate(&self, provider: &str, model: &str, parameters: &ModelParameters) -> bool {
        let key = ModelKey::new(provider, model, parameters);
        let removed = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .is_some();
        if removed {
            info!("Invalidated model handle {}", key);
        }
        removed
    }

    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        info!("Invalidating {} cached model handles", slots.len());
        slots.clear();
    }

    /// Number of ready handles currently cached.
    pub fn cached_len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| matches!(slot.state, SlotState::Ready(_)))
            .count()
    }

    /// Total connector invocations since the factory was built.
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

impl Default for ModelFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct EchoProvider;

    #[async_trait]
    impl LLMProvider for EchoProvider {
        async fn generate(&self, model: &str, prompt: String, _system: Option<String>) -> Result<String> {
            Ok(format!("{}: {}", model, prompt))
        }
    }

    struct SlowConnector {
        fail: AtomicBool,
    }

    #[async_trait]
    impl ProviderConnector for SlowConnector {
        fn provider_id(&self) -> &str {
            "slow"
        }

        async fn connect(&self, _model: &str, _parameters: &ModelParameters) -> Result<Arc<dyn LLMProvider>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("bad credentials");
            }
            Ok(Arc::new(EchoProvider))
        }
    }

    fn factory(fail: bool) -> Arc<ModelFactory> {
        Arc::new(ModelFactory::new().with_connector(Arc::new(SlowConnector {
            fail: AtomicBool::new(fail),
        })))
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let a = ModelParameters::default().with_param("top_p", 0.9).with_param("seed", 7);
        let b = ModelParameters::default().with_param("seed", 7).with_param("top_p", 0.9);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), a.clone().with_temperature(0.2).fingerprint());
    }

    #[test]
    fn test_key_normalizes_provider_and_model() {
        let params = ModelParameters::default();
        assert_eq!(ModelKey::new(" Slow ", "M1", &params), ModelKey::new("slow", "m1", &params));
    }

    #[tokio::test]
    async fn test_concurrent_get_single_construction() {
        let factory = factory(false);
        let params = ModelParameters::default().with_temperature(0.1);

        let a = {
            let factory = factory.clone();
            let params = params.clone();
            tokio::spawn(async move { factory.get("slow", "m1", &params).await })
        };
        let b = {
            let factory = factory.clone();
            let params = params.clone();
            tokio::spawn(async move { factory.get("slow", "m1", &params).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.construction_count(), 1);
        assert_eq!(factory.cached_len(), 1);

        let c = factory.get("slow", "m1", &params).await.unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(factory.construction_count(), 1);
        assert_eq!(c.complete("hi".into(), None).await.unwrap(), "m1: hi");
    }

    #[tokio::test]
    async fn test_failed_construction_is_shared_and_not_cached() {
        let factory = factory(true);
        let params = ModelParameters::default();

        let (a, b) = tokio::join!(factory.get("slow", "m1", &params), factory.get("slow", "m1", &params));
        assert!(matches!(a, Err(OrchestratorError::ProviderConfig(_))));
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(factory.construction_count(), 1);
        assert_eq!(factory.cached_len(), 0);

        // Next call retries construction.
        assert!(factory.get("slow", "m1", &params).await.is_err());
        assert_eq!(factory.construction_count(), 2);
    }

    #[tokio::test]
    async fn test_handle_uses_normalized_model_name() {
        let factory = factory(false);
        let params = ModelParameters::default();

        let first = factory.get("slow", " Qwen2 ", &params).await.unwrap();
        let second = factory.get("SLOW", "qwen2", &params).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.model(), "qwen2");
        assert_eq!(second.complete("hi".into(), None).await.unwrap(), "qwen2: hi");
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let factory = factory(false);
        let err = factory.get("nope", "m1", &ModelParameters::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ProviderConfig(_)));
        assert_eq!(factory.construction_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let factory = factory(false);
        let params = ModelParameters::default();
        let first = factory.get("slow", "m1", &params).await.unwrap();

        assert!(factory.invalidate("slow", "m1", &params));
        let second = factory.get("slow", "m1", &params).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        factory.invalidate_all();
        assert_eq!(factory.cached_len(), 0);
        assert_eq!(factory.construction_count(), 2);
    }
}
