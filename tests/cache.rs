use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use unify_llm::backend::{Backend, BackendKind};
use unify_llm::cache::{build_cache, CacheBackend, CacheKey, CacheManager, JsonFileCache};
use unify_llm::engine::GenerationEngine;
use unify_llm::pool::Adapter;
use unify_llm::types::{GenerationRequest, GenerationResult};
use unify_llm::utils::fingerprint_value;
use unify_llm::{CacheConfig, InferenceConfig, ModelConfig, Result};

fn json_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
        .count()
}

#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl Backend for Counting {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    async fn generate_one(
        &self,
        request: &GenerationRequest,
        _config: &InferenceConfig,
    ) -> Result<GenerationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerationResult::new(request.clone(), "Y", self.engine_tag()))
    }
}

fn engine(backend: Arc<Counting>, cache: CacheManager) -> GenerationEngine {
    let adapter = Adapter::new(
        backend,
        ModelConfig::new("api", "stub").with_sdk_type("openai"),
        InferenceConfig::default().with_sleep_seconds(0.0),
        fingerprint_value(&json!("stub")),
    );
    GenerationEngine::new(Arc::new(adapter)).with_cache(Arc::new(cache))
}

#[tokio::test]
async fn test_unflushed_writes_stay_in_memory_until_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileCache::open(dir.path(), 3).await.unwrap();
    let manager = CacheManager::new(Arc::new(store));

    manager.set(&CacheKey::new("a"), &"1").await;
    manager.set(&CacheKey::new("b"), &"2").await;
    // threshold - 1 writes are only in memory
    assert_eq!(json_files(dir.path()), 0);
    assert_eq!(manager.get::<String>(&CacheKey::new("b")).await.as_deref(), Some("2"));

    manager.set(&CacheKey::new("c"), &"3").await;
    assert_eq!(json_files(dir.path()), 3);
}

#[tokio::test]
async fn test_persisted_payload_matches_loaded_payload() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::json_file(dir.path()).with_flush_threshold(1);
    let manager = build_cache(&config).await.unwrap();
    manager.set(&CacheKey::new("k"), &json!({"answer": 42})).await;

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("k.json")).unwrap()).unwrap();
    assert_eq!(raw["data"], json!({"answer": 42}));
    assert!(raw["meta_data"]["time"].as_f64().unwrap() > 0.0);

    let reopened = build_cache(&config).await.unwrap();
    assert_eq!(
        reopened.get::<serde_json::Value>(&CacheKey::new("k")).await,
        Some(json!({"answer": 42}))
    );
}

#[tokio::test]
async fn test_cache_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::json_file(dir.path());
    let request = GenerationRequest::from_prompt("X", "");

    let first_backend = Arc::new(Counting::default());
    let first = engine(first_backend.clone(), build_cache(&config).await.unwrap());
    let produced = first.generate(vec![request.clone()]).await.unwrap();
    assert_eq!(produced[0].response, "Y");
    first.shutdown().await.unwrap();
    assert_eq!(json_files(dir.path()), 1);

    let second_backend = Arc::new(Counting::default());
    let second = engine(second_backend.clone(), build_cache(&config).await.unwrap());
    let replayed = second.generate(vec![request]).await.unwrap();

    assert_eq!(replayed, produced);
    assert_eq!(first_backend.calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_force_update_misses_right_after_save() {
    let dir = tempfile::tempdir().unwrap();
    let manager = build_cache(&CacheConfig::json_file(dir.path()).with_force_update(true))
        .await
        .unwrap();
    let key = CacheKey::new("k");
    manager.set(&key, &"v").await;
    assert_eq!(manager.get::<String>(&key).await, None);
    assert_eq!(manager.backend().len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_corrupt_entry_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
    std::fs::write(dir.path().join("shape.json"), br#"{"data": 7}"#).unwrap();

    let manager = build_cache(&CacheConfig::json_file(dir.path())).await.unwrap();
    assert_eq!(manager.get::<String>(&CacheKey::new("broken")).await, None);
    // well-formed file, wrong payload type
    assert_eq!(manager.get::<String>(&CacheKey::new("shape")).await, None);
    assert_eq!(manager.stats().errors, 1);
}

#[tokio::test]
async fn test_unknown_store_name_is_configuration_error() {
    let config = CacheConfig {
        cache_type: "sqlite".into(),
        ..CacheConfig::memory()
    };
    let err = build_cache(&config).await.err().unwrap();
    assert!(err.is_configuration());
}

#[tokio::test]
#[ignore = "requires a running redis (set REDIS_URL)"]
async fn test_redis_store_shares_entries_between_managers() {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".into());
    let writer = build_cache(&CacheConfig::redis(url.clone())).await.unwrap();
    let reader = build_cache(&CacheConfig::redis(url)).await.unwrap();

    let key = CacheKey::new(format!("unify-llm-it-{}", uuid::Uuid::new_v4()));
    writer.set(&key, &"shared").await;
    assert_eq!(reader.get::<String>(&key).await.as_deref(), Some("shared"));
}
