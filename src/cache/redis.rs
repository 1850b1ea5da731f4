//! Remote store over Redis with per-operation retry.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use super::backend::CacheBackend;
use super::key::CacheKey;
use crate::config::RedisConfig;
use crate::error::{Error, ErrorContext};
use crate::Result;

/// Shared store: every lookup and write is a round trip.
///
/// Each operation is attempted up to `max_retries` times with a fixed
/// `sleep_interval` between attempts. The last error is returned once the
/// attempts run out; the cache manager turns it into a miss or a dropped write.
pub struct RedisCache {
    conn: ConnectionManager,
    max_retries: u32,
    sleep_interval: Duration,
}

impl RedisCache {
    /// Connect, verify the server answers `PING`, then seed from `json_dir` if set.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid redis url: {}", e),
                ErrorContext::new().with_field_path("cache_config.redis.url"),
            )
        })?;
        let mut conn = ConnectionManager::new(client).await.map_err(|e| {
            error!(error = %e, "cannot connect to redis");
            Error::cache_with_context(
                format!("cannot connect to redis: {}", e),
                ErrorContext::new().with_source("redis"),
            )
        })?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "redis ping failed");
                Error::cache_with_context(
                    format!("redis ping failed: {}", e),
                    ErrorContext::new().with_source("redis"),
                )
            })?;

        let cache = Self {
            conn,
            max_retries: config.max_retries.max(1),
            sleep_interval: config.retry_interval(),
        };
        if let Some(dir) = &config.json_dir {
            cache.seed_from_dir(dir).await?;
        }
        Ok(cache)
    }

    /// Copy every `<key>.json` file in `dir` into the store.
    pub async fn seed_from_dir(&self, dir: &Path) -> Result<usize> {
        info!(dir = %dir.display(), "seeding redis cache from json files");
        let mut seeded = 0;
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = tokio::fs::read(&path).await?;
            let value: Value = serde_json::from_slice(&bytes)?;
            self.set(&CacheKey::new(key), &value).await?;
            seeded += 1;
        }
        Ok(seeded)
    }

    async fn get_once(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set_once(&self, key: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.get_once(&key.hash).await {
                Ok(v) => return Ok(v),
                // a stored value that is not JSON will not improve on retry
                Err(e @ Error::Serialization(_)) => return Err(e),
                Err(e) if attempt >= self.max_retries => {
                    error!(key = %key, attempts = attempt, error = %e, "redis load failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(key = %key, attempt, max_retries = self.max_retries, error = %e, "redis load error");
                    tokio::time::sleep(self.sleep_interval).await;
                }
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.set_once(&key.hash, &payload).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.max_retries => {
                    error!(key = %key, attempts = attempt, error = %e, "redis save failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(key = %key, attempt, max_retries = self.max_retries, error = %e, "redis save error");
                    tokio::time::sleep(self.sleep_interval).await;
                }
            }
        }
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let n: usize = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(n)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let cfg = RedisConfig {
            url: "not a url".into(),
            ..RedisConfig::default()
        };
        let err = RedisCache::connect(&cfg).await.err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    #[ignore = "requires a running redis (set REDIS_URL)"]
    async fn test_roundtrip_against_live_server() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".into());
        let cache = RedisCache::connect(&RedisConfig {
            url,
            ..RedisConfig::default()
        })
        .await
        .unwrap();
        let key = CacheKey::new(format!("unify-llm-test-{}", uuid::Uuid::new_v4()));
        assert!(cache.get(&key).await.unwrap().is_none());
        cache.set(&key, &serde_json::json!({"data": "x"})).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().unwrap()["data"], "x");
    }
}
