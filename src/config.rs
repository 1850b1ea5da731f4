//! 配置模块：模型、推理与缓存配置的加载和覆盖。
//!
//! # Configuration
//!
//! A run is described by one YAML document:
//!
//! ```yaml
//! model_config:
//!   inference_backend: api
//!   model_name_or_path: deepseek-chat
//!   model_sdk_type: openai
//!   api_key_name: DEEPSEEK_API_KEY
//! inference_config:
//!   max_retry: 3
//!   max_workers: 32
//!   sleep_seconds: 30
//!   temperature: 0.7
//! cache_config:
//!   cache_type: json_file
//!   cache_dir: ./cache
//! ```
//!
//! Fields the runtime does not interpret itself (sampling parameters, backend
//! loader arguments) are kept in flattened maps and forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, ErrorContext};
use crate::Result;

/// Model fields that never influence generated text.
const VOLATILE_MODEL_KEYS: &[&str] = &["api_key", "api_key_name"];

/// Inference fields that only tune the runtime (retry, parallelism, waiting).
const OPERATIONAL_INFERENCE_KEYS: &[&str] = &[
    "max_retry",
    "max_workers",
    "sleep_seconds",
    "request_timeout_seconds",
];

fn default_max_retry() -> u32 {
    3
}

fn default_max_workers() -> usize {
    32
}

fn default_sleep_seconds() -> f64 {
    30.0
}

/// Identity and backend selection of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend kind tag (`api`, `hf`, `vllm`).
    pub inference_backend: String,
    #[serde(default)]
    pub model_name_or_path: String,
    /// Wire protocol for the `api` backend (`openai`, `anthropic`, `gemini`, `dashscope`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_sdk_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the key when `api_key` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelConfig {
    pub fn new(inference_backend: impl Into<String>, model_name_or_path: impl Into<String>) -> Self {
        Self {
            inference_backend: inference_backend.into(),
            model_name_or_path: model_name_or_path.into(),
            model_sdk_type: None,
            api_key: None,
            api_key_name: None,
            base_url: None,
            extra: Map::new(),
        }
    }

    pub fn with_sdk_type(mut self, sdk: impl Into<String>) -> Self {
        self.model_sdk_type = Some(sdk.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_api_key_name(mut self, name: impl Into<String>) -> Self {
        self.api_key_name = Some(name.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Credential for remote backends.
    ///
    /// An explicit `api_key` wins; otherwise `api_key_name` must name a set
    /// environment variable. Neither present yields `Ok(None)`.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        if let Some(key) = &self.api_key {
            return Ok(Some(key.clone()));
        }
        match &self.api_key_name {
            Some(name) => std::env::var(name).map(Some).map_err(|_| {
                Error::configuration_with_context(
                    format!("environment variable {} is not set", name),
                    ErrorContext::new()
                        .with_field_path("model_config.api_key_name")
                        .with_source("config"),
                )
            }),
            None => Ok(None),
        }
    }

    /// JSON view with credential material removed.
    pub fn redacted(&self) -> Value {
        self.view_without(&[])
    }

    /// The part of the model identity that shapes generated text.
    ///
    /// `extra_volatile` lists backend-specific fields (e.g. loader arguments)
    /// to drop on top of the credentials.
    pub fn essential(&self, extra_volatile: &[&str]) -> Value {
        self.view_without(extra_volatile)
    }

    fn view_without(&self, extra: &[&str]) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = v {
            for key in VOLATILE_MODEL_KEYS.iter().chain(extra) {
                map.remove(*key);
            }
        }
        v
    }
}

/// Runtime tuning plus backend generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Fixed pause between failed attempts.
    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: f64,
    /// Per-attempt bound; unset waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_seconds: Option<f64>,
    /// Generation parameters forwarded to the backend (`temperature`, `max_tokens`, ...).
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            max_workers: default_max_workers(),
            sleep_seconds: default_sleep_seconds(),
            request_timeout_seconds: None,
            params: Map::new(),
        }
    }
}

impl InferenceConfig {
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_sleep_seconds(mut self, secs: f64) -> Self {
        self.sleep_seconds = secs;
        self
    }

    pub fn with_request_timeout_seconds(mut self, secs: f64) -> Self {
        self.request_timeout_seconds = Some(secs);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Number of attempts per request; zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_retry.max(1)
    }

    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.sleep_seconds).unwrap_or(Duration::ZERO)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_seconds
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    /// Generation parameters only; operational fields are excluded.
    pub fn essential(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = v {
            for key in OPERATIONAL_INFERENCE_KEYS {
                map.remove(*key);
            }
        }
        v
    }

    /// New configuration with `delta` merged over this one (top-level keys replace).
    pub fn merged(&self, delta: &Map<String, Value>) -> Result<Self> {
        let mut v = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = v {
            for (k, val) in delta {
                map.insert(k.clone(), val.clone());
            }
        }
        serde_json::from_value(v).map_err(|e| {
            Error::configuration_with_context(
                "invalid inference configuration override",
                ErrorContext::new()
                    .with_field_path("inference_config")
                    .with_details(e.to_string()),
            )
        })
    }
}

fn default_cache_type() -> String {
    "json_file".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_flush_threshold() -> usize {
    10
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_redis_sleep_interval() -> f64 {
    0.1
}

/// Settings for the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_max_retry")]
    pub max_retries: u32,
    #[serde(default = "default_redis_sleep_interval")]
    pub sleep_interval: f64,
    /// Directory of `<key>.json` files copied into the store at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_dir: Option<PathBuf>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            max_retries: default_max_retry(),
            sleep_interval: default_redis_sleep_interval(),
            json_dir: None,
        }
    }
}

impl RedisConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.sleep_interval).unwrap_or(Duration::ZERO)
    }
}

/// Which cache store to use and how it behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_type")]
    pub cache_type: String,
    /// Treat every lookup as a miss so stored entries get regenerated.
    #[serde(default)]
    pub force_update: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: default_cache_type(),
            force_update: false,
            cache_dir: default_cache_dir(),
            flush_threshold: default_flush_threshold(),
            redis: RedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn json_file(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self {
            cache_type: "memory".to_string(),
            ..Self::default()
        }
    }

    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            cache_type: "redis".to_string(),
            redis: RedisConfig {
                url: url.into(),
                ..RedisConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn with_force_update(mut self, force_update: bool) -> Self {
        self.force_update = force_update;
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }
}

/// Complete configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub model_config: ModelConfig,
    #[serde(default)]
    pub inference_config: InferenceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_config: Option<CacheConfig>,
}

impl AppConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config file: {}", e),
                ErrorContext::new().with_source(path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&content)
    }

    /// Set a dotted path (e.g. `inference_config.temperature`) to a YAML scalar.
    ///
    /// Dashes in path segments are read as underscores. Intermediate objects
    /// are created as needed; the result is re-validated against the schema.
    pub fn apply_override(&mut self, dotted_path: &str, raw_value: &str) -> Result<()> {
        let value: Value = serde_yaml::from_str(raw_value)
            .unwrap_or_else(|_| Value::String(raw_value.to_string()));
        let segments: Vec<String> = dotted_path
            .split('.')
            .map(|s| s.trim().replace('-', "_"))
            .collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::configuration_with_context(
                "empty segment in override path",
                ErrorContext::new().with_field_path(dotted_path),
            ));
        }

        let mut doc = serde_json::to_value(&*self)?;
        if !set_path(&mut doc, &segments, value) {
            return Err(Error::configuration_with_context(
                "override path crosses a scalar value",
                ErrorContext::new().with_field_path(dotted_path),
            ));
        }

        *self = serde_json::from_value(doc).map_err(|e| {
            Error::configuration_with_context(
                "override produced an invalid configuration",
                ErrorContext::new()
                    .with_field_path(dotted_path)
                    .with_details(e.to_string()),
            )
        })?;
        Ok(())
    }
}

/// Insert `value` at `segments`, turning missing or null parents into objects.
fn set_path(target: &mut Value, segments: &[String], value: Value) -> bool {
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let map = match target {
        Value::Object(map) => map,
        _ => return false,
    };
    match segments {
        [last] => {
            map.insert(last.clone(), value);
            true
        }
        [head, rest @ ..] => set_path(
            map.entry(head.clone()).or_insert(Value::Null),
            rest,
            value,
        ),
        [] => false,
    }
}
