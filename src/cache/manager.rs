//! Cache manager.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::key::CacheKey;
use crate::utils::unix_timestamp;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Front of a [`CacheBackend`] that never lets a store failure escape.
///
/// Entries are stored as `{"data": <value>, "meta_data": {"time": <unix secs>}}`.
/// A failed or undecodable load is a miss; a failed save is logged and dropped.
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    force_update: bool,
    stats: AtomicStats,
}

impl CacheManager {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            force_update: false,
            stats: AtomicStats::default(),
        }
    }

    /// Make every lookup a miss; writes still go through.
    pub fn with_force_update(mut self, force_update: bool) -> Self {
        self.force_update = force_update;
        self
    }

    pub fn force_update(&self) -> bool {
        self.force_update
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if self.force_update {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match self.backend.get(key).await {
            Ok(Some(mut entry)) => {
                let data = entry
                    .get_mut("data")
                    .map(Value::take)
                    .unwrap_or(Value::Null);
                match serde_json::from_value(data) {
                    Ok(v) => {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, backend = self.backend.name(), "cache hit");
                        Some(v)
                    }
                    Err(e) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(key = %key, error = %e, "discarding undecodable cache entry");
                        None
                    }
                }
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, backend = self.backend.name(), "cache miss");
                None
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache load failed, treating as miss");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let data = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache value not serializable");
                return;
            }
        };
        let entry = json!({
            "data": data,
            "meta_data": { "time": unix_timestamp() },
        });
        match self.backend.set(key, &entry).await {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache save failed, dropping entry");
            }
        }
    }

    /// Push buffered writes to durable storage.
    pub async fn flush(&self) -> Result<()> {
        self.backend.flush().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }
}
