//! Cache key derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Option names that influence the provider's output and therefore the cache key.
pub const DEFAULT_ALLOWED_OPTIONS: &[&str] = &[
    "max_tokens",
    "stop",
    "temperature",
    "top_p",
    "presence_penalty",
    "frequency_penalty",
    "best_of",
    "logit_bias",
    "suffix",
];

pub const DEFAULT_MODEL: &str = "default";

/// `max_tokens` value asking for the budget left after the prompt.
pub const AUTO_MAX_TOKENS: &str = "auto";

/// Whitelisted options of a cached request, ordered by name.
pub type CacheOptions = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Completion,
    Embedding,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Completion => "completion",
            CacheKind::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub model: String,
    pub kind: CacheKind,
    pub group: String,
    pub prompt_hash: String,
    pub options_hash: String,
    /// Content address of `prompt + "-" + canonical options`; names shard files and remote documents.
    pub hash: String,
    pub temp_bucket: u32,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}#{}",
            self.model, self.kind, self.group, self.hash, self.temp_bucket
        )
    }
}

/// Derives [`CacheKey`]s from a prompt and its raw request options.
///
/// Only allow-listed options take part in the key, so routing metadata such as
/// `stream` or `api_key` never splits the cache. The filtered options are
/// serialized with object keys sorted at every depth before hashing.
#[derive(Debug, Clone)]
pub struct CacheKeyDeriver {
    allowed: Vec<String>,
    default_model: String,
}

impl CacheKeyDeriver {
    pub fn new() -> Self {
        Self {
            allowed: DEFAULT_ALLOWED_OPTIONS.iter().map(|s| s.to_string()).collect(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_allowed_options<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn allowed_options(&self) -> &[String] {
        &self.allowed
    }

    /// Reduce `raw` to the allow-listed, non-null entries.
    ///
    /// `max_tokens: "auto"` is resolved per call from the prompt length, so it
    /// is dropped like an omitted value.
    pub fn filter_options(&self, raw: &serde_json::Map<String, Value>) -> CacheOptions {
        self.allowed
            .iter()
            .filter_map(|name| match raw.get(name) {
                Some(Value::Null) | None => None,
                Some(Value::String(s)) if name == "max_tokens" && s == AUTO_MAX_TOKENS => None,
                Some(v) => Some((name.clone(), v.clone())),
            })
            .collect()
    }

    pub fn derive(
        &self,
        kind: CacheKind,
        prompt: &str,
        raw_options: &serde_json::Map<String, Value>,
        group: &str,
        temp_bucket: u32,
    ) -> CacheKey {
        self.derive_with_options(kind, prompt, raw_options, group, temp_bucket)
            .0
    }

    /// Like [`derive`](Self::derive) but also returns the filtered options, which
    /// are what a [`CacheRecord`](super::CacheRecord) stores.
    pub fn derive_with_options(
        &self,
        kind: CacheKind,
        prompt: &str,
        raw_options: &serde_json::Map<String, Value>,
        group: &str,
        temp_bucket: u32,
    ) -> (CacheKey, CacheOptions) {
        let options = self.filter_options(raw_options);
        let canonical = canonical_options(&options);
        let model = raw_options
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_model)
            .to_string();
        // Embeddings are deterministic; a single bucket is enough.
        let temp_bucket = match kind {
            CacheKind::Completion => temp_bucket,
            CacheKind::Embedding => 0,
        };

        let key = CacheKey {
            model,
            kind,
            group: group.to_string(),
            prompt_hash: sha256_hex(prompt.as_bytes()),
            options_hash: sha256_hex(canonical.as_bytes()),
            hash: sha256_hex(format!("{}-{}", prompt, canonical).as_bytes()),
            temp_bucket,
        };
        (key, options)
    }
}

impl Default for CacheKeyDeriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of temperature buckets a request at `temperature` may spread over.
///
/// Greedy sampling (temperature <= 0) has one bucket; otherwise the count grows
/// with the temperature, capped at `max_buckets`.
pub fn temp_bucket_count(temperature: f64, max_buckets: u32) -> u32 {
    let max_buckets = max_buckets.max(1);
    if !temperature.is_finite() || temperature <= 0.0 {
        return 1;
    }
    let n = (temperature * max_buckets as f64).ceil();
    (n as u32).clamp(1, max_buckets)
}

/// Serialize `options` with object keys sorted at every nesting level.
pub fn canonical_options(options: &CacheOptions) -> String {
    let sorted: BTreeMap<&String, Value> = options.iter().map(|(k, v)| (k, sort_value(v))).collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), sort_value(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
