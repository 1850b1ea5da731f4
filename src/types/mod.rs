//! 类型系统模块：请求、结果与对话消息。
//!
//! # Types Module
//!
//! Core data model shared by every layer of the runtime.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Message`] | One conversation turn with role and content |
//! | [`MessageRole`] | Turn role (system, user, assistant) |
//! | [`GenerationRequest`] | Conversation plus generation-shaping metadata |
//! | [`GenerationResult`] | Produced response, originating request and metadata |
//!
//! ## Example
//!
//! ```rust
//! use unify_llm::types::{GenerationRequest, Message};
//!
//! let request = GenerationRequest::from_prompt("What is 2 + 2?", "You are terse.")
//!     .with_prefill("The answer is");
//! assert!(request.validate().is_ok());
//! assert_eq!(request.conversation.last(), Some(&Message::assistant("The answer is")));
//! ```

pub mod message;
pub mod request;
pub mod result;

pub use message::{ContentBlock, Message, MessageContent, MessageRole};
pub use request::GenerationRequest;
pub use result::{GenerationResult, ERROR_KEY};
