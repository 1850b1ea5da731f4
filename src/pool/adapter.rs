//! Pooled backend instance.

use arc_swap::ArcSwap;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{Backend, BackendKind};
use crate::config::{InferenceConfig, ModelConfig};
use crate::error::{Error, ErrorContext};
use crate::types::{GenerationRequest, GenerationResult};
use crate::utils::{fingerprint_value, Fingerprint};
use crate::Result;

/// A live backend together with the configuration it was created for.
///
/// The inference configuration can be swapped temporarily through
/// [`Adapter::override_inference`]; the model configuration is fixed.
pub struct Adapter {
    backend: Arc<dyn Backend>,
    model_config: ModelConfig,
    inference: ArcSwap<InferenceConfig>,
    fingerprint: Fingerprint,
    shut_down: AtomicBool,
}

impl Adapter {
    pub fn new(
        backend: Arc<dyn Backend>,
        model_config: ModelConfig,
        inference_config: InferenceConfig,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            backend,
            model_config,
            inference: ArcSwap::from_pointee(inference_config),
            fingerprint,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn engine_tag(&self) -> &'static str {
        self.backend.engine_tag()
    }

    /// Pool key: fingerprint of the full configuration at creation time.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Current inference configuration, including active overrides.
    pub fn inference_config(&self) -> Arc<InferenceConfig> {
        self.inference.load_full()
    }

    /// Fingerprint of the generation-relevant configuration under `inference`.
    ///
    /// Credentials, backend-declared volatile model fields and operational
    /// inference fields are excluded.
    pub fn essential_fingerprint_for(&self, inference: &InferenceConfig) -> Fingerprint {
        fingerprint_value(&json!({
            "model_cfgs": self.model_config.essential(self.backend.volatile_model_keys()),
            "inference_cfgs": inference.essential(),
        }))
    }

    /// Essential fingerprint under the current inference configuration.
    pub fn essential_fingerprint(&self) -> Fingerprint {
        self.essential_fingerprint_for(&self.inference_config())
    }

    pub fn requires_prefill_merge(&self) -> bool {
        self.backend.requires_prefill_merge()
    }

    /// One attempt against the backend under an explicit configuration snapshot.
    pub async fn generate_with(
        &self,
        request: &GenerationRequest,
        config: &InferenceConfig,
    ) -> Result<GenerationResult> {
        if self.is_shut_down() {
            return Err(Error::backend_with_context(
                "adapter has been shut down",
                ErrorContext::new().with_source(self.kind().as_str()),
            ));
        }
        self.backend.generate_one(request, config).await
    }

    /// One attempt under the current inference configuration.
    pub async fn generate_one(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let config = self.inference_config();
        self.generate_with(request, &config).await
    }

    /// Shut the backend down. Only the first call reaches the backend.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!(fingerprint = %self.fingerprint, "adapter already shut down");
            return Ok(());
        }
        info!(kind = %self.kind(), fingerprint = %self.fingerprint, "shutting down adapter");
        self.backend.shutdown().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Merge `delta` over the inference configuration until the guard drops.
    ///
    /// The previous configuration is restored on every exit path, including
    /// early returns and panics. Guards must be dropped in reverse order of
    /// creation; overlapping overrides from independent tasks are not isolated.
    pub fn override_inference(&self, delta: &Map<String, Value>) -> Result<InferenceOverrideGuard<'_>> {
        let previous = self.inference.load_full();
        let next = previous.merged(delta)?;
        debug!(keys = ?delta.keys().collect::<Vec<_>>(), "applying inference override");
        self.inference.store(Arc::new(next));
        Ok(InferenceOverrideGuard {
            adapter: self,
            previous,
        })
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("kind", &self.kind())
            .field("model", &self.model_config.model_name_or_path)
            .field("fingerprint", &self.fingerprint)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Restores the inference configuration captured when the override was applied.
#[must_use = "the override is reverted as soon as the guard is dropped"]
pub struct InferenceOverrideGuard<'a> {
    adapter: &'a Adapter,
    previous: Arc<InferenceConfig>,
}

impl InferenceOverrideGuard<'_> {
    /// The configuration that will be restored.
    pub fn previous(&self) -> &InferenceConfig {
        &self.previous
    }
}

impl Drop for InferenceOverrideGuard<'_> {
    fn drop(&mut self) {
        self.adapter.inference.store(self.previous.clone());
        debug!("inference override reverted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Echo {
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl Backend for Echo {
        fn kind(&self) -> BackendKind {
            BackendKind::Vllm
        }

        async fn generate_one(
            &self,
            request: &GenerationRequest,
            config: &InferenceConfig,
        ) -> Result<GenerationResult> {
            let temp = config.params.get("temperature").cloned().unwrap_or(Value::Null);
            Ok(GenerationResult::new(request.clone(), temp.to_string(), self.engine_tag()))
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn volatile_model_keys(&self) -> &[&'static str] {
            &["tensor_parallel_size"]
        }
    }

    fn adapter(echo: Arc<Echo>) -> Adapter {
        Adapter::new(
            echo,
            ModelConfig::new("vllm", "/m").with_extra("tensor_parallel_size", json!(4)),
            InferenceConfig::default().with_param("temperature", json!(0.0)),
            fingerprint_value(&json!("full")),
        )
    }

    fn delta(temp: f64) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("temperature".into(), json!(temp));
        m
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let echo = Arc::new(Echo::default());
        let a = adapter(echo.clone());
        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        assert_eq!(echo.shutdowns.load(Ordering::SeqCst), 1);
        assert!(a.is_shut_down());
        let err = a.generate_one(&GenerationRequest::from_prompt("q", "")).await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
    }

    #[tokio::test]
    async fn test_override_applies_and_reverts() {
        let a = adapter(Arc::new(Echo::default()));
        let req = GenerationRequest::from_prompt("q", "");
        {
            let _guard = a.override_inference(&delta(0.9)).unwrap();
            assert_eq!(a.generate_one(&req).await.unwrap().response, "0.9");
        }
        assert_eq!(a.generate_one(&req).await.unwrap().response, "0.0");
    }

    #[test]
    fn test_nested_overrides_unwind_in_order() {
        let a = adapter(Arc::new(Echo::default()));
        let outer = a.override_inference(&delta(0.5)).unwrap();
        let inner = a.override_inference(&delta(1.0)).unwrap();
        assert_eq!(a.inference_config().params["temperature"], json!(1.0));
        drop(inner);
        assert_eq!(a.inference_config().params["temperature"], json!(0.5));
        drop(outer);
        assert_eq!(a.inference_config().params["temperature"], json!(0.0));
    }

    #[test]
    fn test_invalid_override_leaves_config_untouched() {
        let a = adapter(Arc::new(Echo::default()));
        let mut bad = Map::new();
        bad.insert("max_retry".into(), json!("lots"));
        assert!(a.override_inference(&bad).is_err());
        assert_eq!(a.inference_config().max_retry, 3);
    }

    #[test]
    fn test_essential_fingerprint_tracks_semantic_changes_only() {
        let a = adapter(Arc::new(Echo::default()));
        let base = a.essential_fingerprint();

        let mut tuning = Map::new();
        tuning.insert("max_workers".into(), json!(1));
        tuning.insert("max_retry".into(), json!(10));
        {
            let _g = a.override_inference(&tuning).unwrap();
            assert_eq!(a.essential_fingerprint(), base);
        }
        {
            let _g = a.override_inference(&delta(0.7)).unwrap();
            assert_ne!(a.essential_fingerprint(), base);
        }
        assert_eq!(a.essential_fingerprint(), base);
    }
}
