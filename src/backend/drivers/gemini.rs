//! Gemini generateContent API 驱动
//!
//! - Uses `contents` with `parts`; roles are `user` and `model`.
//! - System text goes in `system_instruction`.
//! - Sampling parameters live under `generationConfig` in camelCase.
//! - The key is passed as the `key` query parameter.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::types::message::{ContentBlock, Message, MessageContent, MessageRole};
use crate::Result;

use super::{DriverRequest, DriverResponse, ProviderDriver, SdkType, UsageInfo};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Default)]
pub struct GeminiDriver;

impl GeminiDriver {
    pub fn new() -> Self {
        Self
    }

    fn split_messages(messages: &[Message]) -> (Option<Value>, Vec<Value>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();

        for m in messages {
            let role = match m.role {
                MessageRole::System => {
                    system_parts.push(m.content.as_text());
                    continue;
                }
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            contents.push(serde_json::json!({
                "role": role,
                "parts": Self::content_to_parts(&m.content),
            }));
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "parts": [{ "text": system_parts.join("\n\n") }] }))
        };
        (system_instruction, contents)
    }

    fn content_to_parts(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(s) => serde_json::json!([{ "text": s }]),
            MessageContent::Blocks(blocks) => Value::Array(
                blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => serde_json::json!({ "text": text }),
                        ContentBlock::Image { source } if source.source_type == "base64" => {
                            serde_json::json!({
                                "inline_data": {
                                    "mime_type": source.media_type.as_deref().unwrap_or("image/png"),
                                    "data": source.data,
                                }
                            })
                        }
                        ContentBlock::Image { source } => {
                            serde_json::json!({ "file_data": { "file_uri": source.data } })
                        }
                    })
                    .collect(),
            ),
        }
    }

    fn generation_key(key: &str) -> &str {
        match key {
            "max_tokens" => "maxOutputTokens",
            "top_p" => "topP",
            "top_k" => "topK",
            "stop" => "stopSequences",
            other => other,
        }
    }
}

impl ProviderDriver for GeminiDriver {
    fn sdk_type(&self) -> SdkType {
        SdkType::Gemini
    }

    fn default_base_url(&self) -> &'static str {
        GEMINI_BASE_URL
    }

    fn build_request(
        &self,
        messages: &[Message],
        model: &str,
        api_key: Option<&str>,
        params: &Map<String, Value>,
    ) -> Result<DriverRequest> {
        let (system_instruction, contents) = Self::split_messages(messages);

        let mut body = serde_json::json!({ "contents": contents });
        if let Some(sys) = system_instruction {
            body["system_instruction"] = sys;
        }

        let mut gen_config = Map::new();
        for (k, v) in params {
            // explicit nested blocks pass through untouched
            if k == "generationConfig" || k == "safetySettings" {
                body[k] = v.clone();
            } else {
                gen_config.insert(Self::generation_key(k).to_string(), v.clone());
            }
        }
        if !gen_config.is_empty() {
            body["generationConfig"] = Value::Object(gen_config);
        }

        let query = api_key
            .map(|k| vec![("key".to_string(), k.to_string())])
            .unwrap_or_default();

        Ok(DriverRequest {
            path: format!("/models/{}:generateContent", model),
            headers: HashMap::new(),
            query,
            body,
        })
    }

    fn parse_response(&self, body: &Value) -> Result<DriverResponse> {
        let content = body
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<String>()
            });

        let finish_reason = body
            .pointer("/candidates/0/finishReason")
            .and_then(|v| v.as_str())
            .map(|r| match r {
                "STOP" => "stop".to_string(),
                "MAX_TOKENS" => "length".to_string(),
                other => other.to_lowercase(),
            });

        let usage = body.get("usageMetadata").map(|u| UsageInfo {
            prompt_tokens: u["promptTokenCount"].as_u64().unwrap_or(0),
            completion_tokens: u["candidatesTokenCount"].as_u64().unwrap_or(0),
            total_tokens: u["totalTokenCount"].as_u64().unwrap_or(0),
        });

        Ok(DriverResponse {
            content,
            finish_reason,
            usage,
            raw: body.clone(),
        })
    }
}
