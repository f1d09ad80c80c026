//! The bridge facade: cache, dispatch and provider wired into one call path.
//!
//! ```text
//! completion(prompt, options)
//!   -> CacheManager::lookup ---- hit ----> response
//!   -> DispatchQueue::submit(provider)      (miss)
//!   -> CacheManager::store (write-through, failures logged)
//!   -> response
//! ```

use crate::cache::{temp_bucket_count, CacheKind, CacheManager, AUTO_MAX_TOKENS};
use crate::config::BridgeConfig;
use crate::dispatch::DispatchQueue;
use crate::provider::{CompletionProvider, CompletionRequest, EmbeddingProvider, EmbeddingRequest};
use crate::stream::{DeltaSink, NoopSink};
use crate::tokens::{counter_for_model, TokenCounter};
use crate::transport::HttpProvider;
use crate::{Error, ErrorContext, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a call's response is cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallScope {
    /// Cache group; the configured default when unset.
    pub group: Option<String>,
    pub temp_bucket: u32,
}

impl CallScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_temp_bucket(mut self, bucket: u32) -> Self {
        self.temp_bucket = bucket;
        self
    }
}

pub struct AiBridge {
    config: BridgeConfig,
    cache: CacheManager,
    queue: DispatchQueue,
    completions: Arc<dyn CompletionProvider>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    tokens: Option<Arc<dyn TokenCounter>>,
}

impl AiBridge {
    pub fn builder(config: BridgeConfig) -> AiBridgeBuilder {
        AiBridgeBuilder::new(config)
    }

    /// Build a bridge with the configured cache backends and HTTP provider.
    pub async fn from_config(config: BridgeConfig) -> Result<Self> {
        AiBridgeBuilder::new(config).build().await
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Non-streamed completion.
    pub async fn completion(
        &self,
        prompt: &str,
        options: &Map<String, Value>,
        scope: &CallScope,
    ) -> Result<Value> {
        self.completion_streamed(prompt, options, scope, &mut NoopSink)
            .await
    }

    /// Completion that reports deltas to `sink` when `options.stream` is set.
    ///
    /// A cache hit on a streamed call is delivered to the sink as one delta
    /// carrying the whole text.
    pub async fn completion_streamed(
        &self,
        prompt: &str,
        options: &Map<String, Value>,
        scope: &CallScope,
        sink: &mut dyn DeltaSink,
    ) -> Result<Value> {
        if prompt.is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }
        self.check_temp_bucket(options, scope.temp_bucket)?;
        let group = self.group(scope);

        if let Some(hit) = self
            .cache
            .lookup(CacheKind::Completion, prompt, options, group, scope.temp_bucket)
            .await
        {
            if is_stream(options) {
                if let Value::String(text) = &hit {
                    sink.on_delta(text, text)?;
                }
            }
            return Ok(hit);
        }

        let request = CompletionRequest::new(prompt, self.resolve_request_options(prompt, options)?);
        debug!(request_id = %request.request_id, group, "cache miss, dispatching completion");
        let response = self
            .queue
            .submit(self.completions.complete(&request, sink))
            .await??;

        let outcome = self
            .cache
            .store(
                CacheKind::Completion,
                prompt,
                &response,
                options,
                group,
                scope.temp_bucket,
            )
            .await;
        if !outcome.is_complete() {
            warn!(
                request_id = %request.request_id,
                failed = outcome.failures.len(),
                "completion not cached by every backend"
            );
        }
        Ok(response)
    }

    pub async fn embedding(
        &self,
        input: &str,
        options: &Map<String, Value>,
        group: Option<&str>,
    ) -> Result<Value> {
        if input.is_empty() {
            return Err(Error::validation("embedding input must not be empty"));
        }
        let provider = self.embeddings.as_ref().ok_or_else(|| {
            Error::configuration("no embedding provider configured", "provider.embedding_url")
        })?;
        let group = group.unwrap_or(&self.config.default_group);

        if let Some(hit) = self
            .cache
            .lookup(CacheKind::Embedding, input, options, group, 0)
            .await
        {
            return Ok(hit);
        }

        let request = EmbeddingRequest::new(input, options.clone());
        let response = self.queue.submit(provider.embed(&request)).await??;

        let outcome = self
            .cache
            .store(CacheKind::Embedding, input, &response, options, group, 0)
            .await;
        if !outcome.is_complete() {
            warn!(
                request_id = %request.request_id,
                failed = outcome.failures.len(),
                "embedding not cached by every backend"
            );
        }
        Ok(response)
    }

    fn group<'a>(&'a self, scope: &'a CallScope) -> &'a str {
        scope
            .group
            .as_deref()
            .unwrap_or(self.config.default_group.as_str())
    }

    fn check_temp_bucket(&self, options: &Map<String, Value>, bucket: u32) -> Result<()> {
        let temperature = options
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let count = temp_bucket_count(temperature, self.config.max_temp_buckets);
        if bucket >= count {
            return Err(Error::validation_with_context(
                format!(
                    "temp bucket {} out of range for temperature {} ({} buckets)",
                    bucket, temperature, count
                ),
                ErrorContext::new()
                    .with_field_path("temp_bucket")
                    .with_source("bridge"),
            ));
        }
        Ok(())
    }

    /// Options as sent upstream: an `auto` or missing `max_tokens` becomes the
    /// token budget left after the prompt. The cache key keeps the caller's
    /// options.
    fn resolve_request_options(
        &self,
        prompt: &str,
        options: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut resolved = options.clone();
        let total = resolved
            .remove("total_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(self.config.total_tokens);

        let needs_budget = match resolved.get("max_tokens") {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s == AUTO_MAX_TOKENS,
            Some(_) => false,
        };
        if !needs_budget {
            return Ok(resolved);
        }

        let counter = match &self.tokens {
            Some(counter) => counter.clone(),
            None => counter_for_model(
                resolved
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            ),
        };
        let prompt_tokens = counter.count(prompt);
        let budget = total.saturating_sub(prompt_tokens);
        if budget <= self.config.min_response_tokens {
            return Err(Error::validation_with_context(
                format!(
                    "prompt is larger or nearly equal to total token count ({}/{})",
                    prompt_tokens, total
                ),
                ErrorContext::new()
                    .with_field_path("max_tokens")
                    .with_source("bridge"),
            ));
        }
        resolved.insert("max_tokens".into(), Value::from(budget as u64));
        Ok(resolved)
    }
}

fn is_stream(options: &Map<String, Value>) -> bool {
    options.get("stream").and_then(Value::as_bool) == Some(true)
}

/// Builder for [`AiBridge`]. Anything not supplied is built from the config.
pub struct AiBridgeBuilder {
    config: BridgeConfig,
    cache: Option<CacheManager>,
    completions: Option<Arc<dyn CompletionProvider>>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    tokens: Option<Arc<dyn TokenCounter>>,
}

impl AiBridgeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            cache: None,
            completions: None,
            embeddings: None,
            tokens: None,
        }
    }

    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_completion_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.completions = Some(provider);
        self
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.tokens = Some(counter);
        self
    }

    /// Validate the config, build missing parts and run cache setup.
    pub async fn build(self) -> Result<AiBridge> {
        self.config.validate()?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => CacheManager::from_config(&self.config.cache)?,
        };
        cache.setup().await?;

        let queue = DispatchQueue::new(&self.config.dispatch)?;

        let (completions, embeddings) = match self.completions {
            Some(completions) => (completions, self.embeddings),
            None => {
                let http = Arc::new(HttpProvider::new(self.config.provider.clone())?);
                let embeddings = match self.embeddings {
                    Some(e) => Some(e),
                    None if self.config.provider.embedding_url.is_some() => {
                        Some(http.clone() as Arc<dyn EmbeddingProvider>)
                    }
                    None => None,
                };
                (http as Arc<dyn CompletionProvider>, embeddings)
            }
        };

        debug!(
            backends = ?cache.backend_names(),
            provider = completions.name(),
            max_concurrency = queue.max_concurrency(),
            "bridge ready"
        );

        Ok(AiBridge {
            config: self.config,
            cache,
            queue,
            completions,
            embeddings,
            tokens: self.tokens,
        })
    }
}
