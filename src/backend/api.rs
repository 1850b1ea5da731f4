//! Remote API backend.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::drivers::{create_driver, ProviderDriver, SdkType, DEEPSEEK_BASE_URL, QWEN_BASE_URL};
use super::{Backend, BackendKind};
use crate::config::{InferenceConfig, ModelConfig};
use crate::error::{Error, ErrorContext};
use crate::transport::HttpTransport;
use crate::types::{GenerationRequest, GenerationResult, Message};
use crate::Result;

/// Base URLs of known OpenAI-compatible hosted models.
static KNOWN_BASE_URLS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("deepseek-chat", DEEPSEEK_BASE_URL),
        ("deepseek-reasoner", DEEPSEEK_BASE_URL),
        ("qwen-max", QWEN_BASE_URL),
        ("qwen-plus", QWEN_BASE_URL),
    ])
});

/// Backend that calls a hosted model over HTTP.
///
/// Base URL resolution: `model_config.base_url`, then the known-model table
/// for OpenAI-compatible SDKs, then the driver's default endpoint.
pub struct ApiBackend {
    driver: Box<dyn ProviderDriver>,
    transport: HttpTransport,
    model: String,
    api_key: Option<String>,
    safe_model_config: Value,
}

impl ApiBackend {
    pub fn from_config(model: &ModelConfig) -> Result<Self> {
        let sdk_type: SdkType = model
            .model_sdk_type
            .as_deref()
            .ok_or_else(|| {
                Error::configuration_with_context(
                    "model_sdk_type is required for the api backend",
                    ErrorContext::new().with_field_path("model_config.model_sdk_type"),
                )
            })?
            .parse()?;
        if model.model_name_or_path.is_empty() {
            return Err(Error::configuration_with_context(
                "model_name_or_path is required",
                ErrorContext::new().with_field_path("model_config.model_name_or_path"),
            ));
        }

        let driver = create_driver(sdk_type);
        let base_url = model
            .base_url
            .clone()
            .or_else(|| match sdk_type {
                SdkType::OpenAi | SdkType::DashScope => KNOWN_BASE_URLS
                    .get(model.model_name_or_path.as_str())
                    .map(|s| s.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| driver.default_base_url().to_string());

        Ok(Self {
            transport: HttpTransport::new(&base_url)?,
            driver,
            model: model.model_name_or_path.clone(),
            api_key: model.resolve_api_key()?,
            safe_model_config: model.redacted(),
        })
    }

    pub fn sdk_type(&self) -> SdkType {
        self.driver.sdk_type()
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }
}

impl std::fmt::Debug for ApiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiBackend")
            .field("sdk_type", &self.driver.sdk_type())
            .field("model", &self.model)
            .field("base_url", &self.transport.base_url())
            .finish()
    }
}

#[async_trait]
impl Backend for ApiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    async fn generate_one(
        &self,
        request: &GenerationRequest,
        config: &InferenceConfig,
    ) -> Result<GenerationResult> {
        let mut messages = Vec::with_capacity(request.conversation.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(Message::system(request.system_prompt.clone()));
        }
        messages.extend(request.conversation.iter().cloned());

        let wire = self
            .driver
            .build_request(&messages, &self.model, self.api_key.as_deref(), &config.params)?;
        let body = self
            .transport
            .post_json(&wire.path, &wire.headers, &wire.query, &wire.body)
            .await?;
        let parsed = self.driver.parse_response(&body)?;

        let content = parsed.content.ok_or_else(|| {
            Error::backend_with_context(
                "response carried no text content",
                ErrorContext::new()
                    .with_source(self.driver.sdk_type().as_str())
                    .with_details(format!("finish_reason: {:?}", parsed.finish_reason)),
            )
        })?;
        if let Some(usage) = &parsed.usage {
            debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "generation finished"
            );
        }

        Ok(GenerationResult::new(request.clone(), content, self.engine_tag())
            .with_metadata_entry("raw_output", parsed.raw)
            .with_metadata_entry("model_config", self.safe_model_config.clone())
            .with_metadata_entry("inference_config", config.essential()))
    }
}
