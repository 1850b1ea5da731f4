//! 后端适配层：统一的单请求生成契约与后端构造注册表。
//!
//! # Backends
//!
//! A [`Backend`] turns one [`GenerationRequest`] into one [`GenerationResult`]
//! or fails. Everything else (retry, caching, fan-out, pooling) is layered on
//! top by the engine and the instance pool.
//!
//! | Kind | Tag | Resource-heavy | Provided |
//! |------|-----|----------------|----------|
//! | [`BackendKind::Api`] | `api` | no | [`api::ApiBackend`] |
//! | [`BackendKind::HuggingFace`] | `hf` | yes | registered by the application |
//! | [`BackendKind::Vllm`] | `vllm` | yes | registered by the application |
//!
//! Resource-heavy backends keep a model resident in accelerator memory; the
//! pool allows at most one of them to be live at a time.

pub mod api;
pub mod drivers;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{InferenceConfig, ModelConfig};
use crate::error::{Error, ErrorContext};
use crate::types::{GenerationRequest, GenerationResult};
use crate::Result;

pub use api::ApiBackend;

/// Backend family named by `model_config.inference_backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Api,
    HuggingFace,
    Vllm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Api => "api",
            BackendKind::HuggingFace => "hf",
            BackendKind::Vllm => "vllm",
        }
    }

    /// Holds a resident model; at most one such instance may be live.
    pub fn is_resource_heavy(&self) -> bool {
        matches!(self, BackendKind::HuggingFace | BackendKind::Vllm)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api" => Ok(BackendKind::Api),
            "hf" => Ok(BackendKind::HuggingFace),
            "vllm" => Ok(BackendKind::Vllm),
            other => Err(Error::configuration_with_context(
                format!("unknown inference backend: {}", other),
                ErrorContext::new()
                    .with_field_path("model_config.inference_backend")
                    .with_details("expected one of api, hf, vllm"),
            )),
        }
    }
}

/// Single-request generation contract.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Tag stored in [`GenerationResult::engine`].
    fn engine_tag(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Produce one result for `request` or fail. Called concurrently.
    ///
    /// `request` is the wire form: for backends that ask for it, a prefill seed
    /// has already been merged into the preceding turn.
    async fn generate_one(
        &self,
        request: &GenerationRequest,
        config: &InferenceConfig,
    ) -> Result<GenerationResult>;

    /// Release held resources. May be called more than once.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Backend-specific model fields excluded from the essential fingerprint.
    fn volatile_model_keys(&self) -> &[&'static str] {
        &[]
    }

    /// Whether prefilled requests must arrive with the seed merged into the previous turn.
    fn requires_prefill_merge(&self) -> bool {
        true
    }
}

/// Constructor for one backend kind.
pub type BackendConstructor =
    Arc<dyn Fn(&ModelConfig, &InferenceConfig) -> Result<Arc<dyn Backend>> + Send + Sync>;

/// Backend-kind dispatch table used by the instance pool.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: HashMap<BackendKind, BackendConstructor>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the remote API backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BackendKind::Api, |model, _| {
            Ok(Arc::new(ApiBackend::from_config(model)?) as Arc<dyn Backend>)
        });
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: BackendKind, constructor: F) -> &mut Self
    where
        F: Fn(&ModelConfig, &InferenceConfig) -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(constructor));
        self
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Configuration error unless a constructor for `kind` is registered.
    pub fn ensure_registered(&self, kind: BackendKind) -> Result<()> {
        if self.is_registered(kind) {
            Ok(())
        } else {
            Err(Self::unregistered(kind))
        }
    }

    pub fn build(
        &self,
        kind: BackendKind,
        model: &ModelConfig,
        inference: &InferenceConfig,
    ) -> Result<Arc<dyn Backend>> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| Self::unregistered(kind))?;
        constructor(model, inference)
    }

    fn unregistered(kind: BackendKind) -> Error {
        Error::configuration_with_context(
            format!("no constructor registered for backend {}", kind),
            ErrorContext::new()
                .with_field_path("model_config.inference_backend")
                .with_source("backend_registry"),
        )
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("BackendRegistry").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_and_classification() {
        assert_eq!("api".parse::<BackendKind>().unwrap(), BackendKind::Api);
        assert_eq!("hf".parse::<BackendKind>().unwrap(), BackendKind::HuggingFace);
        assert_eq!("vllm".parse::<BackendKind>().unwrap(), BackendKind::Vllm);
        assert!("tgi".parse::<BackendKind>().unwrap_err().is_configuration());

        assert!(!BackendKind::Api.is_resource_heavy());
        assert!(BackendKind::HuggingFace.is_resource_heavy());
        assert!(BackendKind::Vllm.is_resource_heavy());
    }

    #[test]
    fn test_registry_requires_constructor() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.is_registered(BackendKind::Api));
        assert!(!registry.is_registered(BackendKind::Vllm));

        let err = registry
            .build(
                BackendKind::Vllm,
                &ModelConfig::new("vllm", "/models/m"),
                &InferenceConfig::default(),
            )
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert_eq!(format!("{:?}", registry), r#"BackendRegistry { kinds: ["api"] }"#);
    }
}
