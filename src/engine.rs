//! 生成引擎：并发分发、固定间隔重试、缓存短路与结果顺序重组。
//!
//! # Generation Engine
//!
//! [`GenerationEngine::generate`] takes a batch of requests and returns exactly
//! one [`GenerationResult`] per request, in input order. Per request:
//!
//! 1. With a cache attached, look the request up; a hit is returned as stored.
//! 2. Otherwise call the adapter up to `max_retry` times, sleeping
//!    `sleep_seconds` between failed attempts. An optional
//!    `request_timeout_seconds` bounds each attempt.
//! 3. When every attempt fails, produce a failure result (empty response,
//!    `metadata.error` set). Failures are never cached.
//!
//! Only malformed requests make `generate` return `Err`; backend and cache
//! trouble is reported per item.

use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheKeyGenerator, CacheManager};
use crate::config::InferenceConfig;
use crate::error::Error;
use crate::pool::Adapter;
use crate::types::{GenerationRequest, GenerationResult};
use crate::utils::Fingerprint;
use crate::Result;

/// Error marker stored on a result whose attempts were all exhausted.
pub const ALL_ATTEMPTS_FAILED: &str = "All API calls failed";

/// Fans requests out over one adapter with retry and optional caching.
#[derive(Clone)]
pub struct GenerationEngine {
    adapter: Arc<Adapter>,
    cache: Option<Arc<CacheManager>>,
    keys: CacheKeyGenerator,
}

impl GenerationEngine {
    pub fn new(adapter: Arc<Adapter>) -> Self {
        Self {
            adapter,
            cache: None,
            keys: CacheKeyGenerator::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub fn cache(&self) -> Option<&Arc<CacheManager>> {
        self.cache.as_ref()
    }

    /// Cache key of `request` under the adapter's current configuration.
    pub fn cache_key(&self, request: &GenerationRequest) -> CacheKey {
        self.keys
            .generate(request, &self.adapter.essential_fingerprint())
    }

    /// Generate one result per request, positionally matched to the input.
    ///
    /// All requests are validated before any work starts. The inference
    /// configuration is read once per call, so an override applied while a
    /// batch runs does not affect it.
    pub async fn generate(&self, requests: Vec<GenerationRequest>) -> Result<Vec<GenerationResult>> {
        for (idx, request) in requests.iter().enumerate() {
            if let Err(e) = request.validate() {
                warn!(index = idx, error = %e, "rejecting malformed request");
                return Err(e);
            }
        }

        let total = requests.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let config = self.adapter.inference_config();
        let essential = self.adapter.essential_fingerprint_for(&config);
        let batch_id = uuid::Uuid::new_v4();

        let outcomes: Vec<(GenerationResult, bool)> = if total == 1 {
            let mut requests = requests;
            let request = requests.remove(0);
            vec![self.generate_item(request, &config, &essential).await]
        } else {
            self.generate_parallel(requests, config.clone(), essential).await
        };

        let cached = outcomes.iter().filter(|(_, hit)| *hit).count();
        let failed = outcomes.iter().filter(|(r, _)| r.is_error()).count();
        info!(batch_id = %batch_id, total, cached, failed, "batch finished");
        Ok(outcomes.into_iter().map(|(r, _)| r).collect())
    }

    async fn generate_parallel(
        &self,
        requests: Vec<GenerationRequest>,
        config: Arc<InferenceConfig>,
        essential: Fingerprint,
    ) -> Vec<(GenerationResult, bool)> {
        let n = requests.len();
        let limit = config.workers().min(n);
        debug!(requests = n, workers = limit, "dispatching batch");

        let mut out: Vec<Option<(GenerationResult, bool)>> = (0..n).map(|_| None).collect();

        let results: Vec<(usize, (GenerationResult, bool))> =
            futures::stream::iter(requests.into_iter().enumerate())
                .map(|(idx, request)| {
                    let engine = self.clone();
                    let config = config.clone();
                    let essential = essential.clone();
                    async move {
                        let fallback = request.clone();
                        let task = tokio::spawn(async move {
                            engine.generate_item(request, &config, &essential).await
                        });
                        let outcome = match task.await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                error!(index = idx, error = %e, "generation worker aborted");
                                (
                                    GenerationResult::failure(
                                        fallback,
                                        self.adapter.engine_tag(),
                                        format!("generation worker aborted: {}", e),
                                    ),
                                    false,
                                )
                            }
                        };
                        (idx, outcome)
                    }
                })
                .buffer_unordered(limit)
                .collect()
                .await;

        for (idx, outcome) in results {
            out[idx] = Some(outcome);
        }

        out.into_iter()
            .zip(0..)
            .map(|(o, idx)| {
                o.unwrap_or_else(|| {
                    error!(index = idx, "batch result missing");
                    (
                        GenerationResult::failure(
                            GenerationRequest::new(Vec::new()),
                            self.adapter.engine_tag(),
                            "batch result missing",
                        ),
                        false,
                    )
                })
            })
            .collect()
    }

    /// Cache lookup, then retried generation, then cache write. The flag marks a cache hit.
    async fn generate_item(
        &self,
        request: GenerationRequest,
        config: &InferenceConfig,
        essential: &Fingerprint,
    ) -> (GenerationResult, bool) {
        let key = self
            .cache
            .as_ref()
            .map(|_| self.keys.generate(&request, essential));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(mut hit) = cache.get::<GenerationResult>(key).await {
                // the key ignores ref_answer and metadata
                hit.input = request;
                return (hit, true);
            }
        }

        let result = self.generate_with_retry(&request, config).await;

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if !result.is_error() {
                cache.set(key, &result).await;
            }
        }
        (result, false)
    }

    async fn generate_with_retry(
        &self,
        request: &GenerationRequest,
        config: &InferenceConfig,
    ) -> GenerationResult {
        let wire = self.wire_request(request);
        let attempts = config.attempts();
        let interval = config.retry_interval();

        for attempt in 1..=attempts {
            let outcome = match config.request_timeout() {
                Some(limit) => tokio::time::timeout(limit, self.adapter.generate_with(&wire, config))
                    .await
                    .unwrap_or(Err(Error::Timeout(limit))),
                None => self.adapter.generate_with(&wire, config).await,
            };
            match outcome {
                Ok(mut result) => {
                    result.input = request.clone();
                    return result;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_retry = attempts,
                        model = %self.adapter.model_config().model_name_or_path,
                        error = %e,
                        "generation attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }

        error!(
            attempts,
            model = %self.adapter.model_config().model_name_or_path,
            "all generation attempts failed"
        );
        GenerationResult::failure(request.clone(), self.adapter.engine_tag(), ALL_ATTEMPTS_FAILED)
            .with_metadata_entry("model_config", self.adapter.model_config().redacted())
            .with_metadata_entry("inference_config", config.essential())
    }

    /// Request as handed to the backend.
    fn wire_request(&self, request: &GenerationRequest) -> GenerationRequest {
        if !request.prefilled || !self.adapter.requires_prefill_merge() {
            return request.clone();
        }
        match request.merged_prefill() {
            Ok(conversation) => GenerationRequest {
                conversation,
                prefilled: false,
                ..request.clone()
            },
            // validated on entry, so the merge cannot fail here
            Err(_) => request.clone(),
        }
    }

    /// Flush the cache store, then shut the adapter down.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.flush().await {
                warn!(backend = cache.backend_name(), error = %e, "cache flush failed");
            }
        }
        self.adapter.shutdown().await
    }
}
