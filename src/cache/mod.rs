//! Response caching: avoid repeating provider calls for prompts already answered.
//!
//! # Response Caching Module
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheManager`] | Ordered lookups and concurrent write-through over backends |
//! | [`CacheConfig`] | Enable flags per kind and backend settings |
//! | [`CacheBackend`] | Trait implemented by storage backends |
//! | [`JsonlCache`] | Sharded, append-only JSONL files on local disk |
//! | [`RemoteCache`] | Document-store backend with upsert semantics |
//! | [`CacheKeyDeriver`] | Deterministic keys from prompt + filtered options |
//!
//! ## Example
//!
//! ```rust,no_run
//! use ai_bridge::cache::{CacheConfig, CacheKind, CacheManager};
//! use serde_json::json;
//!
//! # async fn run() -> ai_bridge::Result<()> {
//! let cache = CacheManager::from_config(&CacheConfig::new().with_jsonl_path("./cache"))?;
//! cache.setup().await?;
//!
//! let options = json!({"model": "claude-v1", "temperature": 0});
//! let options = options.as_object().unwrap();
//! if cache.lookup(CacheKind::Completion, "Hello", options, "demo", 0).await.is_none() {
//!     let response = json!("Hi there");
//!     cache.store(CacheKind::Completion, "Hello", &response, options, "demo", 0).await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Temperature buckets
//!
//! A non-zero temperature makes responses non-deterministic. Callers pick a
//! bucket in `[0, temp_bucket_count(temperature, max))`; each bucket caches
//! its own sample, so repeated runs reuse samples without collapsing every
//! request onto a single answer.

mod backend;
mod jsonl;
mod key;
mod lock;
mod manager;
mod remote;

pub use backend::{CacheBackend, CacheRecord};
pub use jsonl::{JsonlCache, SHARD_EXTENSION};
pub use key::{
    canonical_options, temp_bucket_count, CacheKey, CacheKeyDeriver, CacheKind, CacheOptions,
    AUTO_MAX_TOKENS, DEFAULT_ALLOWED_OPTIONS, DEFAULT_MODEL,
};
pub use lock::{lock_path_for, LockOptions, ShardLock};
pub use manager::{
    CacheConfig, CacheManager, CacheStats, JsonlCacheConfig, RemoteCacheConfig, StoreOutcome,
    DEFAULT_CACHE_GROUP,
};
#[cfg(feature = "mongodb")]
pub use remote::MongoDocumentStore;
pub use remote::{collection_name, Document, DocumentStore, MemoryDocumentStore, RemoteCache};

/// Cache backend faults. Lookups swallow them as misses; stores report them.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend is not connected; call setup() first")]
    NotConnected,

    #[error("timed out waiting for shard lock on {path}")]
    LockTimeout { path: String },

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("remote cache error: {0}")]
    Remote(String),

    #[error("cache key component {0:?} is not a relative path")]
    InvalidKeyPath(String),
}
