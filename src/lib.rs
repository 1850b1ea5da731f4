//! # unify-llm
//!
//! 统一的大模型生成运行时：同一份请求可在远程 API 与本地常驻模型之间切换，
//! 并通过实例池与内容寻址缓存避免重复加载与重复计算。
//!
//! Backend-agnostic generation runtime. The same logical request runs against
//! a hosted API or a resident local model without changing call sites, while
//! an instance pool avoids reloading heavy models and a content-addressed
//! cache avoids recomputing answers.
//!
//! ## Overview
//!
//! - **Instance pool**: adapters are keyed by a fingerprint of their full
//!   configuration; at most one resource-heavy adapter is live at a time.
//! - **Generation engine**: bounded-parallel fan-out with fixed-interval
//!   retries; results always come back in input order, one per request.
//! - **Cache**: a local JSON-file store with batched flushes, a Redis store
//!   with per-operation retries, or an in-memory map.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use unify_llm::{AppConfig, GenerateOptions, GenerationRequest, Generator, InstancePool};
//!
//! #[tokio::main]
//! async fn main() -> unify_llm::Result<()> {
//!     let config = AppConfig::from_yaml_file("config.yaml")?;
//!     let pool = InstancePool::default();
//!     let generator = Generator::from_config(&pool, &config).await?;
//!
//!     let requests = vec![GenerationRequest::from_prompt("What is 2 + 2?", "")];
//!     let groups = generator
//!         .generate(&requests, GenerateOptions::new().with_repeat_count(2))
//!         .await?;
//!     for result in &groups[0] {
//!         println!("{}", result.response);
//!     }
//!
//!     generator.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | YAML configuration, dotted overrides, credential resolution |
//! | [`types`] | Messages, generation requests and results |
//! | [`backend`] | Backend contract, kind registry, remote API backend |
//! | [`pool`] | Pooled adapters, scoped inference overrides |
//! | [`engine`] | Parallel dispatch, retry, cache short-circuit |
//! | [`cache`] | Cache stores, key construction, statistics |
//! | [`facade`] | `Generator`, prompt builders, repeat sampling |
//! | [`transport`] | HTTP transport used by the API backend |
//! | [`utils`] | Canonical JSON fingerprints |

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod facade;
pub mod pool;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use backend::{Backend, BackendKind, BackendRegistry};
pub use cache::{build_cache, CacheBackend, CacheKey, CacheManager, CacheStats};
pub use config::{AppConfig, CacheConfig, InferenceConfig, ModelConfig, RedisConfig};
pub use engine::GenerationEngine;
pub use facade::{GenerateOptions, Generator, PromptBuilder, PromptBuilderRegistry, PromptTemplate};
pub use pool::{Adapter, InferenceOverrideGuard, InstancePool};
pub use types::{GenerationRequest, GenerationResult, Message, MessageRole};
pub use utils::Fingerprint;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
