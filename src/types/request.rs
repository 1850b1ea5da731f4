//! The logical request submitted for one generation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::message::{Message, MessageContent, MessageRole};
use super::result::GenerationResult;
use crate::error::{Error, ErrorContext};
use crate::Result;

/// One conversation plus the metadata that shapes its generation.
///
/// Values are treated as immutable: every `with_*` helper returns a new request
/// with a single field changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub conversation: Vec<Message>,
    /// The trailing assistant turn is a seed to continue, not a finished answer.
    #[serde(default)]
    pub prefilled: bool,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub ref_answer: Option<String>,
    /// Distinguishes independent samples of the same conversation.
    #[serde(default)]
    pub repeat_index: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GenerationRequest {
    pub fn new(conversation: Vec<Message>) -> Self {
        Self {
            conversation,
            prefilled: false,
            system_prompt: String::new(),
            ref_answer: None,
            repeat_index: 0,
            metadata: Map::new(),
        }
    }

    /// Single-turn request with an optional system instruction.
    pub fn from_prompt(prompt: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Self::new(vec![Message::user(prompt)])
        }
    }

    /// Continue the conversation of a previous result, appending its response
    /// as an assistant turn.
    ///
    /// A leading system turn is dropped and a trailing assistant turn (e.g. a
    /// prefill seed) is replaced by the response.
    pub fn from_result(result: &GenerationResult, use_parsed_output: bool) -> Self {
        let mut conversation = result.input.conversation.clone();
        if conversation.first().map(|m| m.role) == Some(MessageRole::System) {
            conversation.remove(0);
        }
        if conversation.last().map(|m| m.role) == Some(MessageRole::Assistant) {
            warn!(
                turns = conversation.len(),
                "last turn of conversation is assistant, removing it"
            );
            conversation.pop();
        }
        let response = match (&result.parsed_output, use_parsed_output) {
            (Some(Value::String(s)), true) => s.clone(),
            (Some(other), true) => other.to_string(),
            _ => result.response.clone(),
        };
        conversation.push(Message::assistant(response));
        Self::new(conversation)
    }

    /// Check the prefill invariant.
    ///
    /// A prefilled request needs at least two turns and must end with an
    /// assistant turn; otherwise the last turn must come from the user.
    pub fn validate(&self) -> Result<()> {
        let last = self.conversation.last().ok_or_else(|| {
            Error::validation_with_context(
                "conversation is empty",
                ErrorContext::new().with_field_path("conversation"),
            )
        })?;
        let expected = if self.prefilled {
            if self.conversation.len() < 2 {
                return Err(Error::validation_with_context(
                    "prefilled conversation needs at least two turns",
                    ErrorContext::new()
                        .with_field_path("conversation")
                        .with_details(format!("turns: {}", self.conversation.len())),
                ));
            }
            MessageRole::Assistant
        } else {
            MessageRole::User
        };
        if last.role != expected {
            return Err(Error::validation_with_context(
                format!(
                    "last turn must be {} (prefilled: {})",
                    expected.as_str(),
                    self.prefilled
                ),
                ErrorContext::new()
                    .with_field_path(format!("conversation[{}].role", self.conversation.len() - 1))
                    .with_details(format!("found: {}", last.role.as_str())),
            ));
        }
        Ok(())
    }

    /// Conversation as sent to protocols that only accept a trailing user turn.
    ///
    /// For prefilled requests the trailing assistant seed is concatenated onto
    /// the preceding turn and removed as a standalone turn.
    pub fn merged_prefill(&self) -> Result<Vec<Message>> {
        if !self.prefilled {
            return Ok(self.conversation.clone());
        }
        self.validate()?;
        let mut conversation = self.conversation.clone();
        // validate() guarantees at least two turns ending with an assistant seed.
        if let Some(seed) = conversation.pop() {
            if let Some(previous) = conversation.last_mut() {
                previous.content.append(seed.content);
            }
        }
        Ok(conversation)
    }

    /// Text of the user turn being answered.
    pub fn last_user_message(&self) -> Result<String> {
        if self.conversation.is_empty() {
            return Err(Error::validation("the conversation is empty"));
        }
        if self.prefilled && self.conversation.len() == 1 {
            return Err(Error::validation(
                "the conversation is prefilled, but only has one turn",
            ));
        }
        let idx = if self.prefilled {
            self.conversation.len() - 2
        } else {
            self.conversation.len() - 1
        };
        let turn = &self.conversation[idx];
        if turn.role != MessageRole::User {
            return Err(Error::validation_with_context(
                "the last turn is not user",
                ErrorContext::new().with_field_path(format!("conversation[{}].role", idx)),
            ));
        }
        Ok(turn.content.as_text())
    }

    /// `metadata.raw_question` when present, else the last user message.
    pub fn raw_question(&self) -> Result<String> {
        if let Some(Value::String(q)) = self.metadata.get("raw_question") {
            return Ok(q.clone());
        }
        self.last_user_message()
    }

    /// Replace the user turn being answered.
    pub fn with_updated_prompt(&self, prompt: impl Into<String>) -> Result<Self> {
        let offset = if self.prefilled { 2 } else { 1 };
        let idx = self.conversation.len().checked_sub(offset).ok_or_else(|| {
            Error::validation_with_context(
                "no user turn to replace",
                ErrorContext::new().with_details(format!("turns: {}", self.conversation.len())),
            )
        })?;
        let mut next = self.clone();
        next.conversation[idx] = Message::user(prompt);
        Ok(next)
    }

    /// Append a user turn.
    pub fn with_user_message(&self, text: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.conversation.push(Message::user(text));
        next
    }

    pub fn with_ref_answer(&self, ref_answer: impl Into<String>) -> Self {
        Self {
            ref_answer: Some(ref_answer.into()),
            ..self.clone()
        }
    }

    pub fn with_system_prompt(&self, system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..self.clone()
        }
    }

    /// Merge `metadata` over the existing bag.
    pub fn with_metadata(&self, metadata: Map<String, Value>) -> Self {
        let mut next = self.clone();
        next.metadata.extend(metadata);
        next
    }

    /// Seed the assistant answer with `prefix`, replacing an existing seed.
    pub fn with_prefill(&self, prefix: impl Into<String>) -> Self {
        let mut next = self.clone();
        match next.conversation.last_mut() {
            Some(last) if last.role == MessageRole::Assistant => {
                last.content = MessageContent::text(prefix);
            }
            _ => next.conversation.push(Message::assistant(prefix)),
        }
        next.prefilled = true;
        next
    }

    pub fn with_repeat_index(&self, repeat_index: u32) -> Self {
        Self {
            repeat_index,
            ..self.clone()
        }
    }

    /// JSON view without the metadata bag.
    pub fn brief(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = v {
            map.remove("metadata");
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefilled() -> GenerationRequest {
        GenerationRequest::from_prompt("2+2?", "").with_prefill("The answer is")
    }

    #[test]
    fn test_from_prompt() {
        let r = GenerationRequest::from_prompt("hello", "be nice");
        assert_eq!(r.conversation, vec![Message::user("hello")]);
        assert_eq!(r.system_prompt, "be nice");
        assert!(!r.prefilled);
        assert_eq!(r.repeat_index, 0);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(GenerationRequest::new(vec![]).validate().is_err());

        let ends_with_assistant =
            GenerationRequest::new(vec![Message::user("q"), Message::assistant("a")]);
        let err = ends_with_assistant.validate().unwrap_err();
        assert!(err.is_configuration());

        let mut single_prefill = GenerationRequest::new(vec![Message::assistant("seed")]);
        single_prefill.prefilled = true;
        assert!(single_prefill.validate().is_err());

        let mut prefill_ending_user = GenerationRequest::new(vec![
            Message::assistant("a"),
            Message::user("q"),
        ]);
        prefill_ending_user.prefilled = true;
        assert!(prefill_ending_user.validate().is_err());

        assert!(prefilled().validate().is_ok());
    }

    #[test]
    fn test_merged_prefill() {
        let r = prefilled();
        let merged = r.merged_prefill().unwrap();
        assert_eq!(merged, vec![Message::user("2+2?The answer is")]);
        // the request itself is untouched
        assert_eq!(r.conversation.len(), 2);

        let plain = GenerationRequest::from_prompt("x", "");
        assert_eq!(plain.merged_prefill().unwrap(), plain.conversation);
    }

    #[test]
    fn test_with_prefill_replaces_existing_seed() {
        let r = prefilled().with_prefill("Surely");
        assert_eq!(r.conversation.len(), 2);
        assert_eq!(r.conversation[1], Message::assistant("Surely"));
    }

    #[test]
    fn test_last_user_message_and_raw_question() {
        let r = prefilled();
        assert_eq!(r.last_user_message().unwrap(), "2+2?");
        assert_eq!(r.raw_question().unwrap(), "2+2?");

        let mut meta = Map::new();
        meta.insert("raw_question".into(), Value::String("orig".into()));
        assert_eq!(r.with_metadata(meta).raw_question().unwrap(), "orig");

        assert!(GenerationRequest::new(vec![]).last_user_message().is_err());
    }

    #[test]
    fn test_with_updated_prompt() {
        let r = prefilled().with_updated_prompt("3+3?").unwrap();
        assert_eq!(r.conversation[0], Message::user("3+3?"));
        assert_eq!(r.conversation[1], Message::assistant("The answer is"));
        assert!(GenerationRequest::new(vec![]).with_updated_prompt("x").is_err());
    }

    #[test]
    fn test_functional_updates_leave_original() {
        let r = GenerationRequest::from_prompt("q", "");
        let r2 = r.with_repeat_index(3).with_ref_answer("a").with_system_prompt("s");
        assert_eq!(r.repeat_index, 0);
        assert!(r.ref_answer.is_none());
        assert_eq!(r2.repeat_index, 3);
        assert_eq!(r2.ref_answer.as_deref(), Some("a"));
        assert_eq!(r2.system_prompt, "s");
    }

    #[test]
    fn test_from_result_continues_conversation() {
        let input = GenerationRequest::new(vec![
            Message::system("sys"),
            Message::user("q"),
            Message::assistant("seed"),
        ]);
        let result = GenerationResult::new(input, "full answer", "api")
            .with_parsed_output(Some(Value::String("parsed".into())));

        let next = GenerationRequest::from_result(&result, false);
        assert_eq!(
            next.conversation,
            vec![Message::user("q"), Message::assistant("full answer")]
        );
        let parsed = GenerationRequest::from_result(&result, true);
        assert_eq!(parsed.conversation[1], Message::assistant("parsed"));

        let follow_up = next.with_user_message("and then?");
        assert!(follow_up.validate().is_ok());
    }

    #[test]
    fn test_brief_drops_metadata() {
        let mut meta = Map::new();
        meta.insert("k".into(), Value::Bool(true));
        let v = GenerationRequest::from_prompt("q", "").with_metadata(meta).brief();
        assert!(v.get("metadata").is_none());
        assert_eq!(v["conversation"][0]["content"], "q");
    }
}
