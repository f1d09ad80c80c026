//! Provider-call contracts consumed by [`AiBridge`](crate::AiBridge).

use crate::stream::DeltaSink;
use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A completion call as handed to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Request options forwarded as-is (model, sampling controls, `stream`, ...).
    pub options: Map<String, Value>,
    /// Correlation id, also sent to the provider as a header.
    pub request_id: String,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, options: Map<String, Value>) -> Self {
        Self {
            prompt: prompt.into(),
            options,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.options.get("stream").and_then(Value::as_bool) == Some(true)
    }

    pub fn model(&self) -> Option<&str> {
        self.options.get("model").and_then(Value::as_str)
    }

    /// Options plus the prompt, as a JSON request body.
    pub fn body(&self) -> Value {
        let mut body = self.options.clone();
        body.insert("prompt".into(), Value::String(self.prompt.clone()));
        Value::Object(body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRequest {
    pub input: String,
    pub options: Map<String, Value>,
    pub request_id: String,
}

impl EmbeddingRequest {
    pub fn new(input: impl Into<String>, options: Map<String, Value>) -> Self {
        Self {
            input: input.into(),
            options,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn body(&self) -> Value {
        let mut body = self.options.clone();
        body.insert("input".into(), Value::String(self.input.clone()));
        Value::Object(body)
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run the call. Streamed calls report deltas to `sink` as they arrive;
    /// the returned value is always the full response.
    async fn complete(&self, request: &CompletionRequest, sink: &mut dyn DeltaSink)
        -> Result<Value>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<Value>;

    fn name(&self) -> &str;
}
