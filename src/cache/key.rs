//! Cache key generation.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::types::GenerationRequest;
use crate::utils::{fingerprint_value, Fingerprint};

/// Content address of one logical request under one essential configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    /// Essential configuration fingerprint the key was derived under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.fingerprint = Some(fp.into());
        self
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Builds cache keys from the generation-relevant parts of a request.
///
/// The canonical payload is `{system_prompt, conversation, cfgs_hash,
/// prefilled, repeat_idx}`. Free-form request metadata and the reference
/// answer never take part, so annotating a request does not change its key.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator;

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, request: &GenerationRequest, essential: &Fingerprint) -> CacheKey {
        let payload = json!({
            "system_prompt": request.system_prompt,
            "conversation": request.conversation,
            "cfgs_hash": essential.as_str(),
            "prefilled": request.prefilled,
            "repeat_idx": request.repeat_index,
        });
        CacheKey::new(fingerprint_value(&payload).into_string()).with_fingerprint(essential.as_str())
    }
}
