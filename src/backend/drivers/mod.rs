//! Provider 驱动层：将统一对话转换为各厂商 HTTP 请求并解析响应。
//!
//! Each remote SDK type speaks a different chat wire format. A
//! [`ProviderDriver`] turns a conversation plus generation parameters into a
//! [`DriverRequest`] (path, headers, query, body) and extracts the response text
//! from the provider's JSON.

pub mod anthropic;
pub mod gemini;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorContext};
use crate::types::message::{ContentBlock, Message, MessageContent};
use crate::Result;

pub use anthropic::AnthropicDriver;
pub use gemini::GeminiDriver;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub(crate) const QWEN_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Wire protocol of a remote model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkType {
    OpenAi,
    Anthropic,
    Gemini,
    /// Alibaba DashScope through its OpenAI-compatible endpoint.
    DashScope,
}

impl SdkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdkType::OpenAi => "openai",
            SdkType::Anthropic => "anthropic",
            SdkType::Gemini => "gemini",
            SdkType::DashScope => "dashscope",
        }
    }
}

impl fmt::Display for SdkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(SdkType::OpenAi),
            "anthropic" => Ok(SdkType::Anthropic),
            "gemini" => Ok(SdkType::Gemini),
            "dashscope" => Ok(SdkType::DashScope),
            other => Err(Error::configuration_with_context(
                format!("unsupported model sdk type: {}", other),
                ErrorContext::new()
                    .with_field_path("model_config.model_sdk_type")
                    .with_details("expected one of openai, anthropic, gemini, dashscope"),
            )),
        }
    }
}

/// Provider-specific HTTP request, relative to the backend's base URL.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct DriverResponse {
    /// Extracted text content.
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<UsageInfo>,
    /// Raw provider response, kept in result metadata.
    pub raw: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Request/response shaping for one wire protocol.
pub trait ProviderDriver: Send + Sync + fmt::Debug {
    fn sdk_type(&self) -> SdkType;

    /// Base URL used when the model configuration names none.
    fn default_base_url(&self) -> &'static str;

    fn build_request(
        &self,
        messages: &[Message],
        model: &str,
        api_key: Option<&str>,
        params: &Map<String, Value>,
    ) -> Result<DriverRequest>;

    fn parse_response(&self, body: &Value) -> Result<DriverResponse>;
}

/// OpenAI chat completions and compatible providers (DeepSeek, Qwen, local servers).
#[derive(Debug)]
pub struct OpenAiDriver {
    sdk_type: SdkType,
}

impl OpenAiDriver {
    pub fn new() -> Self {
        Self {
            sdk_type: SdkType::OpenAi,
        }
    }

    pub fn dashscope() -> Self {
        Self {
            sdk_type: SdkType::DashScope,
        }
    }

    fn content_to_value(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(s) => Value::String(s.clone()),
            MessageContent::Blocks(blocks) => Value::Array(
                blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
                        ContentBlock::Image { source } => {
                            let url = if source.source_type == "base64" {
                                format!(
                                    "data:{};base64,{}",
                                    source.media_type.as_deref().unwrap_or("image/png"),
                                    source.data
                                )
                            } else {
                                source.data.clone()
                            };
                            serde_json::json!({"type": "image_url", "image_url": {"url": url}})
                        }
                    })
                    .collect(),
            ),
        }
    }
}

impl Default for OpenAiDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderDriver for OpenAiDriver {
    fn sdk_type(&self) -> SdkType {
        self.sdk_type
    }

    fn default_base_url(&self) -> &'static str {
        match self.sdk_type {
            SdkType::DashScope => QWEN_BASE_URL,
            _ => OPENAI_BASE_URL,
        }
    }

    fn build_request(
        &self,
        messages: &[Message],
        model: &str,
        api_key: Option<&str>,
        params: &Map<String, Value>,
    ) -> Result<DriverRequest> {
        let oai_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": Self::content_to_value(&m.content),
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": model,
            "messages": oai_messages,
            "stream": false,
        });
        for (k, v) in params {
            body[k] = v.clone();
        }

        let mut headers = HashMap::new();
        if let Some(key) = api_key {
            headers.insert("authorization".into(), format!("Bearer {}", key));
        }

        Ok(DriverRequest {
            path: "/chat/completions".into(),
            headers,
            query: Vec::new(),
            body,
        })
    }

    fn parse_response(&self, body: &Value) -> Result<DriverResponse> {
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(String::from);
        let finish_reason = body
            .pointer("/choices/0/finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from);
        let usage = body.get("usage").map(|u| UsageInfo {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
        });

        Ok(DriverResponse {
            content,
            finish_reason,
            usage,
            raw: body.clone(),
        })
    }
}

/// Driver for an SDK type.
pub fn create_driver(sdk_type: SdkType) -> Box<dyn ProviderDriver> {
    match sdk_type {
        SdkType::OpenAi => Box::new(OpenAiDriver::new()),
        SdkType::DashScope => Box::new(OpenAiDriver::dashscope()),
        SdkType::Anthropic => Box::new(AnthropicDriver::new()),
        SdkType::Gemini => Box::new(GeminiDriver::new()),
    }
}
