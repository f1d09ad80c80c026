//! Cache backend contract.

use super::key::{CacheKey, CacheOptions};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One cached request/response pair. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub prompt: String,
    pub response: Value,
    pub options: CacheOptions,
}

impl CacheRecord {
    pub fn new(prompt: impl Into<String>, response: Value, options: CacheOptions) -> Self {
        Self {
            prompt: prompt.into(),
            response,
            options,
        }
    }
}

/// A storage location for cached responses.
///
/// `lookup` receives the literal prompt alongside the key so implementations
/// can reject hash collisions. Implementations must tolerate concurrent
/// `store` calls for the same key without duplicating or corrupting records.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// One-time asynchronous setup (connecting to a server, etc).
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn lookup(&self, key: &CacheKey, prompt: &str) -> Result<Option<CacheRecord>>;

    async fn store(&self, key: &CacheKey, record: &CacheRecord) -> Result<()>;

    fn name(&self) -> &'static str;
}
