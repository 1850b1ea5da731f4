//! Cache backend trait and the in-process store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::key::CacheKey;
use crate::Result;

/// A key/value store of cache payloads.
///
/// Implementations return errors freely; [`super::CacheManager`] decides how
/// failures degrade.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>>;
    async fn set(&self, key: &CacheKey, value: &Value) -> Result<()>;
    /// Make buffered writes durable. Stores without buffering do nothing.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// Unbounded in-process store. Contents live as long as the value.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(&key.hash).cloned())
    }

    async fn set(&self, key: &CacheKey, value: &Value) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.hash.clone(), value.clone());
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
