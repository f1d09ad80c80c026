//! Cache manager: ordered lookups and write-through stores across backends.

use super::backend::{CacheBackend, CacheRecord};
use super::jsonl::JsonlCache;
use super::key::{CacheKeyDeriver, CacheKind};
use super::lock::LockOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CACHE_GROUP: &str = "misc/default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache completions.
    pub completion: bool,
    /// Cache embeddings.
    pub embedding: bool,
    pub jsonl: JsonlCacheConfig,
    pub remote: RemoteCacheConfig,
    /// Overrides the default option allow-list used for keys.
    pub allowed_options: Option<Vec<String>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            completion: true,
            embedding: true,
            jsonl: JsonlCacheConfig::default(),
            remote: RemoteCacheConfig::default(),
            allowed_options: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlCacheConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub lock_timeout_ms: u64,
    pub stale_lock_ms: u64,
}

impl Default for JsonlCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".ai-bridge/cache"),
            lock_timeout_ms: 10_000,
            stale_lock_ms: 10_000,
        }
    }
}

impl JsonlCacheConfig {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            stale_after: Duration::from_millis(self.stale_lock_ms),
            ..LockOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    pub enabled: bool,
    /// Connection string, e.g. `mongodb://localhost:27017/ai_bridge`.
    pub url: Option<String>,
    /// Database name; defaults to the one in `url`.
    pub database: Option<String>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completion(mut self, enabled: bool) -> Self {
        self.completion = enabled;
        self
    }

    pub fn with_embedding(mut self, enabled: bool) -> Self {
        self.embedding = enabled;
        self
    }

    pub fn with_jsonl_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.jsonl.enabled = true;
        self.jsonl.path = path.into();
        self
    }

    pub fn without_jsonl(mut self) -> Self {
        self.jsonl.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.jsonl.enabled && self.jsonl.path.as_os_str().is_empty() {
            return Err(Error::configuration(
                "local JSONL cache is enabled but has no path",
                "cache.jsonl.path",
            ));
        }
        if self.jsonl.enabled && self.jsonl.lock_timeout_ms == 0 {
            return Err(Error::configuration(
                "lock timeout must be greater than zero",
                "cache.jsonl.lock_timeout_ms",
            ));
        }
        if self.remote.enabled {
            match self.remote.url.as_deref() {
                None | Some("") => {
                    return Err(Error::configuration(
                        "remote cache is enabled but has no connection url",
                        "cache.remote.url",
                    ))
                }
                Some(u) => {
                    url::Url::parse(u).map_err(|e| {
                        Error::configuration(format!("invalid connection url: {}", e), "cache.remote.url")
                    })?;
                }
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self, kind: CacheKind) -> bool {
        match kind {
            CacheKind::Completion => self.completion,
            CacheKind::Embedding => self.embedding,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
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

struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Result of a write-through; failed backends are listed, never raised.
#[derive(Debug, Default)]
pub struct StoreOutcome {
    pub written: Vec<&'static str>,
    pub failures: Vec<(&'static str, Error)>,
}

impl StoreOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fans cache traffic out over an ordered list of backends.
///
/// Lookups go through the backends in order and stop at the first hit. Stores
/// are issued to every backend concurrently and joined. Backend faults are
/// logged and counted but never returned: a broken cache must not fail a
/// request that can be answered upstream.
pub struct CacheManager {
    config: CacheConfig,
    deriver: CacheKeyDeriver,
    backends: Vec<Arc<dyn CacheBackend>>,
    stats: Arc<AtomicStats>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, backends: Vec<Arc<dyn CacheBackend>>) -> Self {
        let mut deriver = CacheKeyDeriver::new();
        if let Some(allowed) = &config.allowed_options {
            deriver = deriver.with_allowed_options(allowed.iter().cloned());
        }
        Self {
            config,
            deriver,
            backends,
            stats: Arc::new(AtomicStats::new()),
        }
    }

    /// Build the configured backends: the JSONL cache first, then the remote one.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let mut backends: Vec<Arc<dyn CacheBackend>> = Vec::new();
        if config.jsonl.enabled {
            backends.push(Arc::new(
                JsonlCache::new(&config.jsonl.path).with_lock_options(config.jsonl.lock_options()),
            ));
        }
        if config.remote.enabled {
            backends.push(remote_backend(config)?);
        }
        Ok(Self::new(config.clone(), backends))
    }

    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn with_deriver(mut self, deriver: CacheKeyDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn deriver(&self) -> &CacheKeyDeriver {
        &self.deriver
    }

    /// Run each backend's one-time setup. Failures are fatal.
    pub async fn setup(&self) -> Result<()> {
        for backend in &self.backends {
            backend.setup().await?;
            debug!(backend = backend.name(), "cache backend ready");
        }
        Ok(())
    }

    pub fn is_enabled(&self, kind: CacheKind) -> bool {
        self.config.is_enabled(kind) && !self.backends.is_empty()
    }

    pub async fn lookup(
        &self,
        kind: CacheKind,
        prompt: &str,
        options: &serde_json::Map<String, Value>,
        group: &str,
        temp_bucket: u32,
    ) -> Option<Value> {
        if !self.is_enabled(kind) {
            return None;
        }
        let key = self.deriver.derive(kind, prompt, options, group, temp_bucket);

        for backend in &self.backends {
            match backend.lookup(&key, prompt).await {
                Ok(Some(record)) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(backend = backend.name(), key = %key, "cache hit");
                    return Some(record.response);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = backend.name(), key = %key, error = %e, "cache lookup failed");
                }
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "cache miss");
        None
    }

    pub async fn store(
        &self,
        kind: CacheKind,
        prompt: &str,
        response: &Value,
        options: &serde_json::Map<String, Value>,
        group: &str,
        temp_bucket: u32,
    ) -> StoreOutcome {
        let mut outcome = StoreOutcome::default();
        if !self.is_enabled(kind) {
            return outcome;
        }
        let (key, filtered) = self
            .deriver
            .derive_with_options(kind, prompt, options, group, temp_bucket);
        let record = CacheRecord::new(prompt, response.clone(), filtered);

        let writes = self.backends.iter().map(|backend| {
            let key = &key;
            let record = &record;
            async move { (backend.name(), backend.store(key, record).await) }
        });

        for (name, result) in futures::future::join_all(writes).await {
            match result {
                Ok(()) => {
                    self.stats.stores.fetch_add(1, Ordering::Relaxed);
                    outcome.written.push(name);
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = name, key = %key, error = %e, "cache store failed");
                    outcome.failures.push((name, e));
                }
            }
        }
        outcome
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

#[cfg(feature = "mongodb")]
fn remote_backend(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>> {
    use super::remote::{MongoDocumentStore, RemoteCache};
    let url = config.remote.url.clone().unwrap_or_default();
    let store = MongoDocumentStore::new(url, config.remote.database.clone());
    Ok(Arc::new(RemoteCache::new(Arc::new(store))))
}

#[cfg(not(feature = "mongodb"))]
fn remote_backend(_config: &CacheConfig) -> Result<Arc<dyn CacheBackend>> {
    Err(Error::configuration(
        "remote cache requires the `mongodb` feature",
        "cache.remote.enabled",
    ))
}
