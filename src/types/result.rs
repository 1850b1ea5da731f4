//! The outcome of one generation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::request::GenerationRequest;

/// Metadata key whose presence marks a terminal failure.
pub const ERROR_KEY: &str = "error";

/// One produced response together with the request that produced it.
///
/// On total failure `response` is empty and `metadata["error"]` is set; the
/// error marker, not the response text, decides success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub response: String,
    #[serde(default)]
    pub parsed_output: Option<Value>,
    pub input: GenerationRequest,
    /// Backend engine tag, e.g. `api` or `vllm`.
    pub engine: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GenerationResult {
    pub fn new(input: GenerationRequest, response: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            parsed_output: None,
            input,
            engine: engine.into(),
            metadata: Map::new(),
        }
    }

    /// Terminal failure result: empty response and an error marker.
    pub fn failure(
        input: GenerationRequest,
        engine: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(input, "", engine);
        result
            .metadata
            .insert(ERROR_KEY.to_string(), Value::String(reason.into()));
        result
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_parsed_output(&self, parsed_output: Option<Value>) -> Self {
        Self {
            parsed_output,
            ..self.clone()
        }
    }

    pub fn is_error(&self) -> bool {
        self.metadata.contains_key(ERROR_KEY)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(ERROR_KEY).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_marker_governs() {
        let req = GenerationRequest::from_prompt("q", "");
        let ok = GenerationResult::new(req.clone(), "", "api");
        assert!(!ok.is_error(), "an empty response alone is not a failure");

        let failed = GenerationResult::failure(req, "api", "all attempts failed");
        assert!(failed.is_error());
        assert_eq!(failed.response, "");
        assert_eq!(failed.error_message(), Some("all attempts failed"));
    }

    #[test]
    fn test_serde_shape() {
        let req = GenerationRequest::from_prompt("q", "");
        let r = GenerationResult::new(req, "a", "api")
            .with_metadata_entry("raw_output", serde_json::json!({"id": 1}));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["response"], "a");
        assert_eq!(v["engine"], "api");
        assert_eq!(v["metadata"]["raw_output"]["id"], 1);
        let back: GenerationResult = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }
}
