//! Local store: one JSON file per entry, fully mirrored in memory.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use super::key::CacheKey;
use crate::error::{Error, ErrorContext};
use crate::Result;

#[derive(Default)]
struct State {
    entries: HashMap<String, Value>,
    dirty: HashSet<String>,
}

/// Batched-flush store backed by `<cache_dir>/<key>.json` files.
///
/// Every file is read once when the store is opened; lookups never touch the
/// disk afterwards. Writes land in memory and mark the key dirty. Dirty keys
/// are written out once `flush_threshold` distinct keys have accumulated, on
/// [`CacheBackend::flush`], and when the store is dropped.
///
/// Up to `flush_threshold - 1` writes are lost if the process dies between
/// flushes.
pub struct JsonFileCache {
    dir: PathBuf,
    flush_threshold: usize,
    state: Mutex<State>,
}

impl JsonFileCache {
    /// Create `dir` if needed and load every `*.json` file in it.
    ///
    /// Unreadable or malformed files are skipped with a warning.
    pub async fn open(dir: impl Into<PathBuf>, flush_threshold: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::cache_with_context(
                format!("failed to create cache directory: {}", e),
                ErrorContext::new()
                    .with_field_path("cache_config.cache_dir")
                    .with_source(dir.display().to_string()),
            )
        })?;

        let mut entries = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match read_entry(&path).await {
                Ok(value) => {
                    entries.insert(key, value);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable cache file"),
            }
        }
        info!(dir = %dir.display(), entries = entries.len(), "loaded json file cache");

        Ok(Self {
            dir,
            flush_threshold: flush_threshold.max(1),
            state: Mutex::new(State {
                entries,
                dirty: HashSet::new(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of written entries not yet on disk.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.dirty.len()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        file_path(&self.dir, key)
    }

    /// Write every dirty entry. Keys that fail stay dirty; the first error is returned.
    async fn flush_locked(&self, state: &mut State) -> Result<()> {
        let mut first_err = None;
        let keys: Vec<String> = state.dirty.iter().cloned().collect();
        for key in keys {
            let Some(value) = state.entries.get(&key) else {
                state.dirty.remove(&key);
                continue;
            };
            let bytes = serde_json::to_vec_pretty(value)?;
            let path = self.file_path(&key);
            match tokio::fs::write(&path, bytes).await {
                Ok(()) => {
                    state.dirty.remove(&key);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to write cache file");
                    first_err.get_or_insert(Error::cache_with_context(
                        format!("failed to write cache file: {}", e),
                        ErrorContext::new().with_source(path.display().to_string()),
                    ));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn file_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.json", key.replace('/', "_")))
}

async fn read_entry(path: &Path) -> Result<Value> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl CacheBackend for JsonFileCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        Ok(self.state.lock().await.entries.get(&key.hash).cloned())
    }

    async fn set(&self, key: &CacheKey, value: &Value) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.insert(key.hash.clone(), value.clone());
        state.dirty.insert(key.hash.clone());
        if state.dirty.len() >= self.flush_threshold {
            debug!(dirty = state.dirty.len(), "flush threshold reached");
            // entry stays in memory and dirty; the next flush retries it
            if let Err(e) = self.flush_locked(&mut state).await {
                warn!(dirty = state.dirty.len(), error = %e, "threshold flush failed");
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().await.entries.len())
    }

    fn name(&self) -> &'static str {
        "json_file"
    }
}

impl Drop for JsonFileCache {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for key in state.dirty.drain() {
            let Some(value) = state.entries.get(&key) else {
                continue;
            };
            let path = file_path(&self.dir, &key);
            let written = serde_json::to_vec_pretty(value)
                .map_err(Error::from)
                .and_then(|bytes| std::fs::write(&path, bytes).map_err(Error::from));
            if let Err(e) = written {
                warn!(path = %path.display(), error = %e, "failed to flush cache entry on drop");
            }
        }
    }
}
