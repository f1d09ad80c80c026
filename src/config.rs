//! Bridge configuration.
//!
//! Loaded from YAML (or built in code) and validated once at construction.
//! Every section has defaults, so an empty document is a valid config.
//!
//! ```yaml
//! default_group: chat/summaries
//! total_tokens: 9000
//! cache:
//!   jsonl:
//!     path: .ai-bridge/cache
//! dispatch:
//!   max_concurrency: 2
//!   post_call_delay_ms: 250
//! provider:
//!   id: anthropic
//!   completion_url: https://api.anthropic.com/v1/complete
//! ```

use crate::cache::{CacheConfig, DEFAULT_CACHE_GROUP};
use crate::dispatch::DispatchConfig;
use crate::transport::ProviderConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub cache: CacheConfig,
    pub dispatch: DispatchConfig,
    pub provider: ProviderConfig,
    /// Cache group used when a call does not name one.
    pub default_group: String,
    /// Context window used to resolve an `auto` or missing `max_tokens`.
    pub total_tokens: usize,
    /// Smallest response budget `"auto"` may resolve to.
    pub min_response_tokens: usize,
    /// Upper bound on temperature buckets per prompt.
    pub max_temp_buckets: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            dispatch: DispatchConfig::default(),
            provider: ProviderConfig::default(),
            default_group: DEFAULT_CACHE_GROUP.to_string(),
            total_tokens: 90_000,
            min_response_tokens: 50,
            max_temp_buckets: 10,
        }
    }
}

impl BridgeConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::Configuration {
            message: format!("invalid bridge config: {}", e),
            context: ErrorContext::new()
                .with_details(e.location().map_or_else(
                    || "unknown location".to_string(),
                    |l| format!("line {}, column {}", l.line(), l.column()),
                ))
                .with_source("config"),
        })
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration {
                message: format!("failed to read {}: {}", path.display(), e),
                context: ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config"),
            }
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `AI_BRIDGE_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = env::var("AI_BRIDGE_CACHE_DIR") {
            self.cache.jsonl.path = PathBuf::from(dir);
        }
        if let Some(n) = env::var("AI_BRIDGE_MAX_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.dispatch.max_concurrency = n;
        }
        if let Some(ms) = env::var("AI_BRIDGE_POST_CALL_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.dispatch.post_call_delay_ms = ms;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.dispatch.validate()?;
        self.provider.validate()?;
        if self.default_group.trim().is_empty() {
            return Err(Error::configuration(
                "default_group must not be empty",
                "default_group",
            ));
        }
        if self.max_temp_buckets == 0 {
            return Err(Error::configuration(
                "max_temp_buckets must be at least 1",
                "max_temp_buckets",
            ));
        }
        if self.total_tokens <= self.min_response_tokens {
            return Err(Error::configuration(
                format!(
                    "total_tokens ({}) must exceed min_response_tokens ({})",
                    self.total_tokens, self.min_response_tokens
                ),
                "total_tokens",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = BridgeConfig::from_yaml_str("{}").unwrap();
        assert_eq!(cfg, BridgeConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_yaml_overrides_sections() {
        let yaml = r#"
default_group: chat/summaries
total_tokens: 9000
dispatch:
  max_concurrency: 2
cache:
  embedding: false
  jsonl:
    path: /tmp/bridge-cache
provider:
  id: acme
  completion_url: http://localhost:9000/v1/complete
  auth: bearer
"#;
        let cfg = BridgeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.default_group, "chat/summaries");
        assert_eq!(cfg.total_tokens, 9000);
        assert_eq!(cfg.dispatch.max_concurrency, 2);
        assert_eq!(cfg.dispatch.post_call_delay_ms, 0);
        assert!(cfg.cache.completion);
        assert!(!cfg.cache.embedding);
        assert_eq!(cfg.cache.jsonl.path, PathBuf::from("/tmp/bridge-cache"));
        assert_eq!(cfg.provider.auth, crate::transport::AuthScheme::Bearer);
        assert_eq!(cfg.provider.max_attempts, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn malformed_yaml_reports_location() {
        let err = BridgeConfig::from_yaml_str("dispatch: [1, 2").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn validation_names_the_field() {
        let mut cfg = BridgeConfig::default();
        cfg.total_tokens = 40;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("field: total_tokens"));

        let mut cfg = BridgeConfig::default();
        cfg.dispatch.max_concurrency = 0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("dispatch.max_concurrency")
        );
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.yaml");
        tokio::fs::write(&path, "default_group: files/test\n").await.unwrap();
        let cfg = BridgeConfig::from_file(&path).await.unwrap();
        assert_eq!(cfg.default_group, "files/test");

        let missing = BridgeConfig::from_file(dir.path().join("nope.yaml")).await;
        assert!(missing.is_err());
    }
}
