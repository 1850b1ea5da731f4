//! 响应缓存模块：按请求内容寻址的可插拔缓存存储。
//!
//! # Response Caching Module
//!
//! Content-addressable storage of generation results. A cache key is the
//! fingerprint of the generation-relevant parts of a request together with
//! the essential configuration of the adapter serving it, so tuning retry or
//! worker settings never invalidates stored results while changing a sampling
//! parameter does.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheManager`] | Entry envelope, force-update, statistics, failure absorption |
//! | [`CacheBackend`] | Trait for cache stores |
//! | [`JsonFileCache`] | Local store mirrored in memory, flushed in batches |
//! | [`RedisCache`] | Shared remote store with per-operation retry |
//! | [`MemoryCache`] | In-process store |
//! | [`CacheKeyGenerator`] | Cache key construction from a request |
//!
//! ## Example
//!
//! ```rust,no_run
//! use unify_llm::cache::build_cache;
//! use unify_llm::config::CacheConfig;
//!
//! # async fn run() -> unify_llm::Result<()> {
//! let cache = build_cache(&CacheConfig::json_file("./cache").with_flush_threshold(20)).await?;
//! println!("using {} cache", cache.backend_name());
//! # Ok(())
//! # }
//! ```

mod backend;
mod json_file;
mod key;
mod manager;
mod redis;

pub use backend::{CacheBackend, MemoryCache};
pub use json_file::JsonFileCache;
pub use key::{CacheKey, CacheKeyGenerator};
pub use manager::{CacheManager, CacheStats};
pub use redis::RedisCache;

use std::sync::Arc;

use crate::config::CacheConfig;
use crate::error::{Error, ErrorContext};
use crate::Result;

/// Store kinds accepted by `cache_config.cache_type`.
pub const CACHE_TYPES: &[&str] = &["json_file", "redis", "memory"];

/// Construct the store named by `config.cache_type`.
///
/// An unknown store name is a configuration error.
pub async fn build_cache(config: &CacheConfig) -> Result<CacheManager> {
    let backend: Arc<dyn CacheBackend> = match config.cache_type.as_str() {
        "json_file" => Arc::new(JsonFileCache::open(&config.cache_dir, config.flush_threshold).await?),
        "redis" => Arc::new(RedisCache::connect(&config.redis).await?),
        "memory" => Arc::new(MemoryCache::new()),
        other => {
            return Err(Error::configuration_with_context(
                format!("unknown cache type: {}", other),
                ErrorContext::new()
                    .with_field_path("cache_config.cache_type")
                    .with_details(format!("expected one of {:?}", CACHE_TYPES)),
            ))
        }
    };
    Ok(CacheManager::new(backend).with_force_update(config.force_update))
}
