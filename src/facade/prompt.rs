//! Prompt builders: per-item request rewriting and output parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorContext};
use crate::types::{GenerationRequest, GenerationResult};
use crate::Result;

/// Rewrites requests before generation and derives `parsed_output` after it.
///
/// Both hooks are pure per-item functions; the list helpers apply them
/// element-wise and stop at the first error.
pub trait PromptBuilder: Send + Sync {
    fn process_input(&self, request: &GenerationRequest) -> Result<GenerationRequest>;

    fn parse_output(&self, result: &GenerationResult) -> Result<GenerationResult>;

    fn process_input_list(&self, requests: &[GenerationRequest]) -> Result<Vec<GenerationRequest>> {
        requests.iter().map(|r| self.process_input(r)).collect()
    }

    fn parse_output_list(&self, results: &[GenerationResult]) -> Result<Vec<GenerationResult>> {
        results.iter().map(|r| self.parse_output(r)).collect()
    }
}

/// How a caller selects a prompt builder.
///
/// Deserializes from either a bare name or a map carrying `name` plus the
/// builder's own settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptTemplate {
    Named(String),
    Configured {
        name: String,
        #[serde(flatten)]
        config: serde_json::Map<String, Value>,
    },
}

impl PromptTemplate {
    pub fn name(&self) -> &str {
        match self {
            PromptTemplate::Named(name) | PromptTemplate::Configured { name, .. } => name,
        }
    }

    /// Builder settings; empty for [`PromptTemplate::Named`].
    pub fn config(&self) -> Value {
        match self {
            PromptTemplate::Named(_) => Value::Object(Default::default()),
            PromptTemplate::Configured { config, .. } => Value::Object(config.clone()),
        }
    }
}

impl From<String> for PromptTemplate {
    fn from(name: String) -> Self {
        PromptTemplate::Named(name)
    }
}

impl From<&str> for PromptTemplate {
    fn from(name: &str) -> Self {
        PromptTemplate::Named(name.to_string())
    }
}

/// Constructor receiving the builder's settings object.
pub type PromptBuilderConstructor = Arc<dyn Fn(&Value) -> Result<Arc<dyn PromptBuilder>> + Send + Sync>;

/// Name → constructor table for prompt builders.
#[derive(Clone, Default)]
pub struct PromptBuilderRegistry {
    constructors: HashMap<String, PromptBuilderConstructor>,
}

impl PromptBuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `template` builder.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TemplatePromptBuilder::NAME, |config| {
            Ok(Arc::new(TemplatePromptBuilder::from_config(config)?) as Arc<dyn PromptBuilder>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn PromptBuilder>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn build(&self, template: &PromptTemplate) -> Result<Arc<dyn PromptBuilder>> {
        let constructor = self.constructors.get(template.name()).ok_or_else(|| {
            let mut known: Vec<_> = self.constructors.keys().cloned().collect();
            known.sort();
            Error::configuration_with_context(
                format!("unknown prompt builder: {}", template.name()),
                ErrorContext::new()
                    .with_field_path("prompt_template")
                    .with_details(format!("registered: {:?}", known)),
            )
        })?;
        constructor(&template.config())
    }
}

impl fmt::Debug for PromptBuilderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("PromptBuilderRegistry").field("names", &names).finish()
    }
}

/// Wraps the question in a text template and optionally cuts the answer out
/// of the response.
///
/// Settings: `template` (required, must contain `{question}`),
/// `system_prompt` (optional), `answer_marker` (optional; the parsed output
/// is the trimmed text after its last occurrence).
#[derive(Debug, Clone, Deserialize)]
pub struct TemplatePromptBuilder {
    template: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    answer_marker: Option<String>,
}

impl TemplatePromptBuilder {
    pub const NAME: &'static str = "template";
    const PLACEHOLDER: &'static str = "{question}";

    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if !template.contains(Self::PLACEHOLDER) {
            return Err(Error::configuration_with_context(
                "prompt template has no {question} placeholder",
                ErrorContext::new().with_field_path("prompt_template.template"),
            ));
        }
        Ok(Self {
            template,
            system_prompt: None,
            answer_marker: None,
        })
    }

    pub fn with_answer_marker(mut self, marker: impl Into<String>) -> Self {
        self.answer_marker = Some(marker.into());
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(config.clone()).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid template builder settings: {}", e),
                ErrorContext::new().with_field_path("prompt_template"),
            )
        })?;
        let mut builder = Self::new(parsed.template)?;
        builder.system_prompt = parsed.system_prompt;
        builder.answer_marker = parsed.answer_marker;
        Ok(builder)
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn process_input(&self, request: &GenerationRequest) -> Result<GenerationRequest> {
        let question = request.raw_question()?;
        let mut next = request.with_updated_prompt(self.template.replace(Self::PLACEHOLDER, &question))?;
        if !next.metadata.contains_key("raw_question") {
            next.metadata.insert("raw_question".into(), Value::String(question));
        }
        if let Some(system_prompt) = &self.system_prompt {
            next = next.with_system_prompt(system_prompt.clone());
        }
        Ok(next)
    }

    fn parse_output(&self, result: &GenerationResult) -> Result<GenerationResult> {
        if result.is_error() {
            return Ok(result.clone());
        }
        let parsed = match &self.answer_marker {
            Some(marker) => result
                .response
                .rfind(marker.as_str())
                .map(|pos| result.response[pos + marker.len()..].trim().to_string()),
            None => Some(result.response.trim().to_string()),
        };
        Ok(result.with_parsed_output(parsed.map(Value::String)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_template_deserializes_from_name_or_map() {
        let named: PromptTemplate = serde_json::from_value(json!("template")).unwrap();
        assert_eq!(named, PromptTemplate::Named("template".into()));

        let configured: PromptTemplate =
            serde_json::from_value(json!({"name": "template", "template": "Q: {question}"})).unwrap();
        assert_eq!(configured.name(), "template");
        assert_eq!(configured.config(), json!({"template": "Q: {question}"}));
    }

    #[test]
    fn test_unknown_builder_is_configuration_error() {
        let registry = PromptBuilderRegistry::with_defaults();
        let err = registry.build(&PromptTemplate::from("cot")).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_template_requires_placeholder() {
        let registry = PromptBuilderRegistry::with_defaults();
        let err = registry
            .build(&PromptTemplate::Configured {
                name: "template".into(),
                config: json!({"template": "no slot"}).as_object().cloned().unwrap(),
            })
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert!(registry.build(&PromptTemplate::from("template")).is_err());
    }

    #[test]
    fn test_process_input_keeps_raw_question() {
        let builder = TemplatePromptBuilder::new("Answer briefly: {question}")
            .unwrap()
            .with_system_prompt("be terse");
        let original = GenerationRequest::from_prompt("2+2?", "");
        let rewritten = builder.process_input(&original).unwrap();

        assert_eq!(rewritten.last_user_message().unwrap(), "Answer briefly: 2+2?");
        assert_eq!(rewritten.raw_question().unwrap(), "2+2?");
        assert_eq!(rewritten.system_prompt, "be terse");
        assert_eq!(original.last_user_message().unwrap(), "2+2?");

        // applying twice does not nest the template
        let twice = builder.process_input(&rewritten).unwrap();
        assert_eq!(twice.last_user_message().unwrap(), "Answer briefly: 2+2?");
    }

    #[test]
    fn test_parse_output_uses_last_marker() {
        let builder = TemplatePromptBuilder::new("{question}").unwrap().with_answer_marker("Answer:");
        let req = GenerationRequest::from_prompt("q", "");
        let ok = GenerationResult::new(req.clone(), "Answer: 3\nAnswer: 4 ", "api");
        assert_eq!(builder.parse_output(&ok).unwrap().parsed_output, Some(json!("4")));

        let missing = GenerationResult::new(req.clone(), "four", "api");
        assert_eq!(builder.parse_output(&missing).unwrap().parsed_output, None);

        let failed = GenerationResult::failure(req, "api", "All API calls failed");
        assert_eq!(builder.parse_output(&failed).unwrap(), failed);
    }
}
