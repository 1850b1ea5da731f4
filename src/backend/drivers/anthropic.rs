//! Anthropic Messages API 驱动
//!
//! Differences from the OpenAI format:
//! - System messages are a top-level `system` parameter, not part of `messages`.
//! - Content uses typed blocks: `[{"type": "text", "text": "..."}]`.
//! - Response text is at `content[0].text`.
//! - `max_tokens` is required.
//! - The key goes in `x-api-key`.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::types::message::{Message, MessageContent, MessageRole};
use crate::Result;

use super::{DriverRequest, DriverResponse, ProviderDriver, SdkType, UsageInfo};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

#[derive(Debug, Default)]
pub struct AnthropicDriver;

impl AnthropicDriver {
    pub fn new() -> Self {
        Self
    }

    fn split_system_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut turns: Vec<Value> = Vec::new();

        for m in messages {
            let role = match m.role {
                MessageRole::System => {
                    system_parts.push(m.content.as_text());
                    continue;
                }
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            let content = match &m.content {
                MessageContent::Text(s) => serde_json::json!([{ "type": "text", "text": s }]),
                MessageContent::Blocks(_) => serde_json::to_value(&m.content).unwrap_or(Value::Null),
            };
            turns.push(serde_json::json!({ "role": role, "content": content }));
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, turns)
    }
}

impl ProviderDriver for AnthropicDriver {
    fn sdk_type(&self) -> SdkType {
        SdkType::Anthropic
    }

    fn default_base_url(&self) -> &'static str {
        ANTHROPIC_BASE_URL
    }

    fn build_request(
        &self,
        messages: &[Message],
        model: &str,
        api_key: Option<&str>,
        params: &Map<String, Value>,
    ) -> Result<DriverRequest> {
        let (system, turns) = Self::split_system_messages(messages);

        let mut body = serde_json::json!({
            "model": model,
            "messages": turns,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if let Some(sys) = system {
            body["system"] = Value::String(sys);
        }
        for (k, v) in params {
            body[k] = v.clone();
        }

        let mut headers = HashMap::new();
        headers.insert("anthropic-version".into(), ANTHROPIC_VERSION.into());
        if let Some(key) = api_key {
            headers.insert("x-api-key".into(), key.to_string());
        }

        Ok(DriverRequest {
            path: "/messages".into(),
            headers,
            query: Vec::new(),
            body,
        })
    }

    fn parse_response(&self, body: &Value) -> Result<DriverResponse> {
        // Concatenate all text blocks; thinking and tool blocks are skipped.
        let content = body.get("content").and_then(|c| c.as_array()).map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        });

        let finish_reason = body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(|r| match r {
                "end_turn" => "stop".to_string(),
                "max_tokens" => "length".to_string(),
                other => other.to_string(),
            });

        let usage = body.get("usage").map(|u| {
            let input = u["input_tokens"].as_u64().unwrap_or(0);
            let output = u["output_tokens"].as_u64().unwrap_or(0);
            UsageInfo {
                prompt_tokens: input,
                completion_tokens: output,
                total_tokens: input + output,
            }
        });

        Ok(DriverResponse {
            content,
            finish_reason,
            usage,
            raw: body.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_is_hoisted() {
        let driver = AnthropicDriver::new();
        let mut params = Map::new();
        params.insert("max_tokens".into(), json!(256));
        let req = driver
            .build_request(
                &[Message::system("be brief"), Message::user("hi")],
                "claude-3-5-sonnet-latest",
                Some("key"),
                &params,
            )
            .unwrap();
        assert_eq!(req.path, "/messages");
        assert_eq!(req.body["system"], "be brief");
        assert_eq!(req.body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(req.body["messages"][0]["content"][0]["text"], "hi");
        assert_eq!(req.body["max_tokens"], 256);
        assert_eq!(req.headers["x-api-key"], "key");
        assert_eq!(req.headers["anthropic-version"], ANTHROPIC_VERSION);
    }

    #[test]
    fn test_default_max_tokens() {
        let req = AnthropicDriver::new()
            .build_request(&[Message::user("hi")], "m", None, &Map::new())
            .unwrap();
        assert_eq!(req.body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert!(req.body.get("system").is_none());
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": " world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        });
        let resp = AnthropicDriver::new().parse_response(&body).unwrap();
        assert_eq!(resp.content.as_deref(), Some("Hello world"));
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total_tokens, 5);
    }
}
