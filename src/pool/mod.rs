//! 实例池：按配置指纹复用后端实例，并保证重资源后端单实例运行。
//!
//! # Instance Pool
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`InstancePool`] | Fingerprint-keyed adapter cache with heavy-backend eviction |
//! | [`Adapter`] | A live backend plus its configuration |
//! | [`InferenceOverrideGuard`] | Scoped inference configuration override |
//!
//! Resolving the same configuration twice returns the same adapter. Resolving
//! a resource-heavy backend shuts down and removes every other pooled
//! resource-heavy adapter first; remote API adapters are never evicted.

mod adapter;

pub use adapter::{Adapter, InferenceOverrideGuard};

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, BackendRegistry};
use crate::config::{InferenceConfig, ModelConfig};
use crate::utils::{fingerprint, Fingerprint};
use crate::Result;

/// Pool key for a configuration pair.
pub fn instance_fingerprint(model: &ModelConfig, inference: &InferenceConfig) -> Result<Fingerprint> {
    fingerprint(&json!({
        "model_cfgs": model,
        "inference_cfgs": inference,
    }))
}

/// Creates, reuses and tears down adapters.
pub struct InstancePool {
    registry: BackendRegistry,
    instances: Mutex<HashMap<Fingerprint, Arc<Adapter>>>,
}

impl Default for InstancePool {
    fn default() -> Self {
        Self::new(BackendRegistry::with_defaults())
    }
}

impl InstancePool {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Adapter for this exact configuration, creating it if needed.
    ///
    /// The lookup, eviction and insertion run under one lock, so concurrent
    /// resolves never leave two resource-heavy adapters live or evict an
    /// adapter created by a racing call. An unknown or unregistered backend
    /// kind fails with a configuration error and leaves the pool untouched.
    /// An adapter that was shut down explicitly is replaced, not reused.
    pub async fn resolve(&self, model: &ModelConfig, inference: &InferenceConfig) -> Result<Arc<Adapter>> {
        let kind: BackendKind = model.inference_backend.parse()?;
        let key = instance_fingerprint(model, inference)?;

        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&key) {
            if !existing.is_shut_down() {
                debug!(kind = %kind, fingerprint = %key, "reusing pooled adapter");
                return Ok(existing.clone());
            }
            debug!(kind = %kind, fingerprint = %key, "dropping adapter that was shut down");
            instances.remove(&key);
        }

        // fail before evicting anything
        self.registry.ensure_registered(kind)?;

        if kind.is_resource_heavy() {
            let heavy: Vec<Fingerprint> = instances
                .iter()
                .filter(|(_, a)| a.kind().is_resource_heavy())
                .map(|(k, _)| k.clone())
                .collect();
            for evicted in heavy {
                if let Some(adapter) = instances.remove(&evicted) {
                    info!(kind = %adapter.kind(), fingerprint = %evicted, "evicting resource-heavy adapter");
                    if let Err(e) = adapter.shutdown().await {
                        warn!(fingerprint = %evicted, error = %e, "adapter shutdown failed");
                    }
                }
            }
        }

        let backend = self.registry.build(kind, model, inference)?;
        let adapter = Arc::new(Adapter::new(
            backend,
            model.clone(),
            inference.clone(),
            key.clone(),
        ));
        info!(kind = %kind, model = %model.model_name_or_path, fingerprint = %key, "created adapter");
        instances.insert(key, adapter.clone());
        Ok(adapter)
    }

    /// Shut down and remove every pooled adapter.
    pub async fn shutdown_all(&self) {
        let mut instances = self.instances.lock().await;
        for (key, adapter) in instances.drain() {
            if let Err(e) = adapter.shutdown().await {
                warn!(fingerprint = %key, error = %e, "adapter shutdown failed");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.lock().await.is_empty()
    }

    pub async fn contains(&self, key: &Fingerprint) -> bool {
        self.instances.lock().await.contains_key(key)
    }
}
