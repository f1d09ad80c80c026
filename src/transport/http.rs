use crate::provider::{CompletionProvider, CompletionRequest, EmbeddingProvider, EmbeddingRequest};
use crate::stream::{DeltaSink, StreamDecoder};
use crate::transport::TransportError;
use crate::{BoxStream, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const KEYRING_SERVICE: &str = "ai-bridge";
const REQUEST_ID_HEADER: &str = "x-ai-bridge-request-id";

/// How the API key is presented to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `x-api-key: <key>`
    XApiKey,
    /// `Authorization: Bearer <key>`
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider id; names the keyring entry and the `<ID>_API_KEY` variable.
    pub id: String,
    pub completion_url: String,
    pub embedding_url: Option<String>,
    /// Explicit key. Takes precedence over keyring and environment.
    pub api_key: Option<String>,
    pub auth: AuthScheme,
    pub timeout_secs: u64,
    /// Attempts per non-streamed call, including the first.
    pub max_attempts: u32,
    pub headers: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("anthropic-version".to_string(), "2023-01-01".to_string());
        Self {
            id: "anthropic".to_string(),
            completion_url: "https://api.anthropic.com/v1/complete".to_string(),
            embedding_url: None,
            api_key: None,
            auth: AuthScheme::XApiKey,
            timeout_secs: 120,
            max_attempts: 2,
            headers,
        }
    }
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, completion_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            completion_url: completion_url.into(),
            headers: BTreeMap::new(),
            ..Self::default()
        }
    }

    pub fn with_embedding_url(mut self, url: impl Into<String>) -> Self {
        self.embedding_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::configuration("provider id is empty", "provider.id"));
        }
        url::Url::parse(&self.completion_url).map_err(|e| {
            Error::configuration(
                format!("invalid completion url: {}", e),
                "provider.completion_url",
            )
        })?;
        if let Some(ref u) = self.embedding_url {
            url::Url::parse(u).map_err(|e| {
                Error::configuration(
                    format!("invalid embedding url: {}", e),
                    "provider.embedding_url",
                )
            })?;
        }
        if self.max_attempts == 0 {
            return Err(Error::configuration(
                "max_attempts must be at least 1",
                "provider.max_attempts",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::configuration(
                "timeout_secs must be positive",
                "provider.timeout_secs",
            ));
        }
        Ok(())
    }
}

/// Completion and embedding provider over HTTP.
pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    api_key: Option<String>,
    decoder: StreamDecoder,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| Self::get_api_key(&config.id));
        if api_key.is_none() {
            debug!(provider = %config.id, "no API key configured");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;

        Ok(Self {
            client,
            config,
            api_key,
            decoder: StreamDecoder::new(),
        })
    }

    fn get_api_key(provider_id: &str) -> Option<String> {
        // 1. Try Keyring
        if let Ok(entry) = Entry::new(KEYRING_SERVICE, provider_id) {
            if let Ok(key) = entry.get_password() {
                return Some(key);
            }
        }

        // 2. Try Environment Variable (PROVIDER_API_KEY)
        let env_var = format!("{}_API_KEY", provider_id.to_uppercase().replace('-', "_"));
        env::var(env_var).ok()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn request(&self, url: &str, body: &Value, request_id: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(url)
            .json(body)
            .header(REQUEST_ID_HEADER, request_id);
        if let Some(key) = &self.api_key {
            req = match self.config.auth {
                AuthScheme::XApiKey => req.header("x-api-key", key),
                AuthScheme::Bearer => req.bearer_auth(key),
            };
        }
        for (k, v) in &self.config.headers {
            req = req.header(k, v);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(TransportError::Http)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let code = status.as_u16();
        let message = resp
            .text()
            .await
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
        Err(Error::Remote {
            status: code,
            message,
            retryable: code == 429 || status.is_server_error(),
        })
    }

    async fn post_json(&self, url: &str, body: &Value, request_id: &str) -> Result<Value> {
        let resp = self.send(self.request(url, body, request_id)).await?;
        let json = resp.json().await.map_err(TransportError::Http)?;
        Ok(json)
    }

    async fn with_retry<T, F, Fut>(&self, request_id: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(
                        provider = %self.config.id,
                        request_id,
                        attempt,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<Value> {
        let json = self
            .post_json(&self.config.completion_url, &request.body(), &request.request_id)
            .await?;
        if let Some(err) = json.get("error") {
            return Err(Error::Remote {
                status: 200,
                message: describe_error_body(err),
                retryable: true,
            });
        }
        match json.get("completion") {
            Some(Value::String(text)) => Ok(Value::String(text.clone())),
            _ => Err(Error::Remote {
                status: 200,
                message: "response has no completion field".to_string(),
                retryable: false,
            }),
        }
    }

    async fn complete_streamed(
        &self,
        request: &CompletionRequest,
        sink: &mut dyn DeltaSink,
    ) -> Result<Value> {
        let req = self
            .request(&self.config.completion_url, &request.body(), &request.request_id)
            .header("accept", "text/event-stream");
        let resp = self.send(req).await?;

        let byte_stream: BoxStream<'_, Bytes> = Box::pin(
            resp.bytes_stream()
                .map_err(|e| Error::Transport(TransportError::Http(e))),
        );
        let text = self.decoder.decode(byte_stream, sink).await?;
        Ok(Value::String(text))
    }

    async fn embed_once(&self, url: &str, request: &EmbeddingRequest) -> Result<Value> {
        let json = self.post_json(url, &request.body(), &request.request_id).await?;
        if let Some(err) = json.get("error") {
            return Err(Error::Remote {
                status: 200,
                message: describe_error_body(err),
                retryable: true,
            });
        }
        json.pointer("/data/0/embedding")
            .filter(|v| v.is_array())
            .cloned()
            .ok_or_else(|| Error::Remote {
                status: 200,
                message: "response has no data[0].embedding".to_string(),
                retryable: false,
            })
    }
}

fn describe_error_body(err: &Value) -> String {
    let kind = err.get("type").and_then(Value::as_str).unwrap_or("error");
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    format!("[{}] {}", kind, message)
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
        sink: &mut dyn DeltaSink,
    ) -> Result<Value> {
        debug!(
            provider = %self.config.id,
            request_id = %request.request_id,
            stream = request.is_stream(),
            "completion call"
        );
        // Deltas already handed to the sink cannot be taken back, so streamed
        // calls are attempted once.
        if request.is_stream() {
            return self.complete_streamed(request, sink).await;
        }
        self.with_retry(&request.request_id, || self.complete_once(request))
            .await
    }

    fn name(&self) -> &str {
        &self.config.id
    }
}

#[async_trait]
impl EmbeddingProvider for HttpProvider {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<Value> {
        let url = self.config.embedding_url.as_deref().ok_or_else(|| {
            Error::configuration("no embedding endpoint configured", "provider.embedding_url")
        })?;
        self.with_retry(&request.request_id, || self.embed_once(url, request))
            .await
    }

    fn name(&self) -> &str {
        &self.config.id
    }
}
