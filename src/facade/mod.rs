//! 生成门面：提示词预处理、重复采样展开、结果分组与作用域配置覆盖。
//!
//! # Generation Facade
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Generator`] | Entry point bundling a pooled adapter, an optional cache and prompt builders |
//! | [`GenerateOptions`] | Per-call repeat count and prompt template |
//! | [`PromptBuilder`] | Request rewriting and output parsing hooks |
//! | [`PromptBuilderRegistry`] | Name → prompt builder constructor table |
//!
//! `generate` returns one group per input request; each group holds
//! `repeat_count` results ordered by repeat index.

mod prompt;

pub use prompt::{
    PromptBuilder, PromptBuilderConstructor, PromptBuilderRegistry, PromptTemplate,
    TemplatePromptBuilder,
};

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::cache::build_cache;
use crate::config::AppConfig;
use crate::engine::GenerationEngine;
use crate::error::{Error, ErrorContext};
use crate::pool::{Adapter, InferenceOverrideGuard, InstancePool};
use crate::types::{GenerationRequest, GenerationResult};
use crate::Result;

/// Options for [`Generator::generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Independent samples per input; each gets its own repeat index.
    pub repeat_count: u32,
    pub prompt_template: Option<PromptTemplate>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            repeat_count: 1,
            prompt_template: None,
        }
    }
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repeat_count(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<PromptTemplate>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }
}

/// Caller-facing generation entry point.
#[derive(Clone)]
pub struct Generator {
    engine: GenerationEngine,
    prompts: PromptBuilderRegistry,
}

impl Generator {
    pub fn new(engine: GenerationEngine) -> Self {
        Self {
            engine,
            prompts: PromptBuilderRegistry::with_defaults(),
        }
    }

    /// Resolve the adapter from `pool` and open the configured cache store.
    pub async fn from_config(pool: &InstancePool, config: &AppConfig) -> Result<Self> {
        let adapter = pool
            .resolve(&config.model_config, &config.inference_config)
            .await?;
        let mut engine = GenerationEngine::new(adapter);
        if let Some(cache_config) = &config.cache_config {
            engine = engine.with_cache(Arc::new(build_cache(cache_config).await?));
        }
        Ok(Self::new(engine))
    }

    pub fn with_prompt_registry(mut self, prompts: PromptBuilderRegistry) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn engine(&self) -> &GenerationEngine {
        &self.engine
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        self.engine.adapter()
    }

    pub fn prompt_registry_mut(&mut self) -> &mut PromptBuilderRegistry {
        &mut self.prompts
    }

    /// Generate `repeat_count` results for every request.
    ///
    /// Caller-owned requests are never modified. Configuration errors (a
    /// zero repeat count, an unknown prompt builder, a malformed request)
    /// are returned before anything is dispatched.
    pub async fn generate(
        &self,
        requests: &[GenerationRequest],
        options: GenerateOptions,
    ) -> Result<Vec<Vec<GenerationResult>>> {
        if options.repeat_count == 0 {
            return Err(Error::configuration_with_context(
                "repeat_count must be at least 1",
                ErrorContext::new().with_field_path("repeat_count"),
            ));
        }
        let builder = options
            .prompt_template
            .as_ref()
            .map(|t| self.prompts.build(t))
            .transpose()?;

        let inputs = match &builder {
            Some(b) => b.process_input_list(requests)?,
            None => requests.to_vec(),
        };

        let repeat = options.repeat_count;
        let expanded: Vec<GenerationRequest> = inputs
            .iter()
            .flat_map(|req| (0..repeat).map(move |idx| req.with_repeat_index(idx)))
            .collect();
        debug!(inputs = inputs.len(), repeat_count = repeat, "expanded requests");

        let mut outputs = self.engine.generate(expanded).await?;
        if let Some(b) = &builder {
            outputs = b.parse_output_list(&outputs)?;
        }

        Ok(outputs
            .chunks(repeat as usize)
            .map(|group| group.to_vec())
            .collect())
    }

    /// Generate for a single request, `repeat_count` times.
    pub async fn generate_one(
        &self,
        request: &GenerationRequest,
        options: GenerateOptions,
    ) -> Result<Vec<GenerationResult>> {
        let mut groups = self.generate(std::slice::from_ref(request), options).await?;
        Ok(groups.pop().unwrap_or_default())
    }

    /// Merge `delta` over the inference configuration until the guard drops.
    ///
    /// Calls started while the guard is alive use the overridden values,
    /// including cache-key computation.
    pub fn update_inference_config(&self, delta: &Map<String, Value>) -> Result<InferenceOverrideGuard<'_>> {
        self.engine.adapter().override_inference(delta)
    }

    /// Flush the cache and shut the adapter down.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.shutdown().await
    }
}
