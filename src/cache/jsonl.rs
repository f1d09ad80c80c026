//! Sharded JSONL file cache.
//!
//! Layout below the base directory:
//!
//! ```text
//! <model>/<completion|embedding>/<group>/<hash[0:2]>/<hash[2:4]>/<hash>.jsonl
//! ```
//!
//! Every line of a shard file is one self-contained JSON record. Files are
//! plain text so a cache directory can be committed, reviewed and merged like
//! any other file. Reads take no lock; writes hold the shard's lock file for
//! the read-check-append sequence only.

use super::backend::{CacheBackend, CacheRecord};
use super::key::{CacheKey, CacheKind, CacheOptions};
use super::lock::{LockOptions, ShardLock};
use super::CacheError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

pub const SHARD_EXTENSION: &str = "jsonl";

/// On-disk shape of one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShardLine {
    prompt: String,
    #[serde(rename = "tempBucket", default, skip_serializing_if = "Option::is_none")]
    temp_bucket: Option<u32>,
    #[serde(default)]
    opt: CacheOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completion: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<Value>,
}

impl ShardLine {
    fn from_record(key: &CacheKey, record: &CacheRecord) -> Self {
        let mut line = ShardLine {
            prompt: record.prompt.clone(),
            temp_bucket: None,
            opt: record.options.clone(),
            completion: None,
            embedding: None,
        };
        match key.kind {
            CacheKind::Completion => {
                line.temp_bucket = Some(key.temp_bucket);
                line.completion = Some(record.response.clone());
            }
            CacheKind::Embedding => line.embedding = Some(record.response.clone()),
        }
        line
    }

    fn into_record_if_match(self, key: &CacheKey, prompt: &str) -> Option<CacheRecord> {
        if self.temp_bucket.unwrap_or(0) != key.temp_bucket || self.prompt != prompt {
            return None;
        }
        let response = match key.kind {
            CacheKind::Completion => self.completion?,
            CacheKind::Embedding => self.embedding?,
        };
        Some(CacheRecord {
            prompt: self.prompt,
            response,
            options: self.opt,
        })
    }
}

pub struct JsonlCache {
    base_dir: PathBuf,
    lock: LockOptions,
}

impl JsonlCache {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Shard file holding records for `key`.
    pub fn shard_path(&self, key: &CacheKey) -> PathBuf {
        let hash = &key.hash;
        let (p1, p2) = (&hash[..2.min(hash.len())], &hash[2.min(hash.len())..4.min(hash.len())]);
        self.base_dir
            .join(&key.model)
            .join(key.kind.as_str())
            .join(&key.group)
            .join(p1)
            .join(p2)
            .join(format!("{}.{}", hash, SHARD_EXTENSION))
    }

    /// [`shard_path`](Self::shard_path) after checking that model and group
    /// cannot climb out of the base directory.
    fn checked_shard_path(&self, key: &CacheKey) -> std::result::Result<PathBuf, CacheError> {
        for part in [&key.model, &key.group] {
            let relative = Path::new(part)
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !relative {
                return Err(CacheError::InvalidKeyPath(part.clone()));
            }
        }
        Ok(self.shard_path(key))
    }

    /// Stream through the shard and return the first matching record.
    /// Only newline-terminated lines are considered.
    async fn scan(
        &self,
        path: &Path,
        key: &CacheKey,
        prompt: &str,
    ) -> std::result::Result<Option<CacheRecord>, CacheError> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 || buf.last() != Some(&b'\n') {
                // EOF, or a trailing line still being written
                return Ok(None);
            }
            let raw = &buf[..buf.len() - 1];
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let line: ShardLine = serde_json::from_slice(raw)?;
            if let Some(record) = line.into_record_if_match(key, prompt) {
                return Ok(Some(record));
            }
        }
    }

    fn prepare_parent(path: &Path) {
        let Some(parent) = path.parent().map(Path::to_path_buf) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&parent).await {
                debug!(dir = %parent.display(), error = %e, "could not pre-create shard directory");
            }
        });
    }

    /// Cut off a trailing fragment left by an interrupted append so the next
    /// record starts on its own line.
    async fn truncate_partial_tail(path: &Path) -> std::result::Result<(), CacheError> {
        let data = match tokio::fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() || data.last() == Some(&b'\n') {
            return Ok(());
        }
        let keep = data
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        warn!(
            shard = %path.display(),
            dropped_bytes = data.len() - keep,
            "truncating partial record at end of shard"
        );
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(keep as u64).await?;
        Ok(())
    }

    /// Runs under the shard lock. Returns whether a line was written.
    async fn append_if_absent(
        &self,
        path: &Path,
        key: &CacheKey,
        record: &CacheRecord,
    ) -> std::result::Result<bool, CacheError> {
        match self.scan(path, key, &record.prompt).await {
            Ok(Some(_)) => {
                debug!(key = %key, "record already committed by another writer");
                return Ok(false);
            }
            Ok(None) => {}
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Self::truncate_partial_tail(path).await?;

        let mut line = serde_json::to_vec(&ShardLine::from_record(key, record))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(true)
    }
}

#[async_trait]
impl CacheBackend for JsonlCache {
    async fn lookup(&self, key: &CacheKey, prompt: &str) -> Result<Option<CacheRecord>> {
        let path = self.checked_shard_path(key)?;
        match self.scan(&path, key, prompt).await {
            Ok(found) => Ok(found),
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::prepare_parent(&path);
                Ok(None)
            }
            Err(e) => {
                // Unlocked reads may race a writer; a miss is the safe answer.
                debug!(shard = %path.display(), error = %e, "shard scan aborted, treating as miss");
                Ok(None)
            }
        }
    }

    async fn store(&self, key: &CacheKey, record: &CacheRecord) -> Result<()> {
        let path = self.checked_shard_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CacheError::Io)?;
        }

        let lock = ShardLock::acquire(&path, &self.lock).await?;
        let outcome = self.append_if_absent(&path, key, record).await;
        let released = lock.release().await;

        let written = outcome?;
        released?;
        if written {
            debug!(key = %key, shard = %path.display(), "cache record appended");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKeyDeriver;
    use serde_json::json;

    fn key(kind: CacheKind, prompt: &str, bucket: u32) -> CacheKey {
        let opts = json!({"model": "claude-v1", "temperature": 0.5});
        CacheKeyDeriver::new().derive(kind, prompt, opts.as_object().unwrap(), "misc/default", bucket)
    }

    #[test]
    fn shard_path_layout() {
        let cache = JsonlCache::new("/base");
        let k = key(CacheKind::Completion, "Hello", 0);
        let expected = PathBuf::from("/base")
            .join("claude-v1")
            .join("completion")
            .join("misc/default")
            .join(&k.hash[0..2])
            .join(&k.hash[2..4])
            .join(format!("{}.jsonl", k.hash));
        assert_eq!(cache.shard_path(&k), expected);
    }

    #[test]
    fn escaping_model_or_group_is_rejected() {
        let cache = JsonlCache::new("/base");
        let mut k = key(CacheKind::Completion, "Hello", 0);
        assert!(cache.checked_shard_path(&k).is_ok());

        for model in ["/tmp/x", "../up", "a/../../b"] {
            k.model = model.to_string();
            assert!(matches!(
                cache.checked_shard_path(&k),
                Err(CacheError::InvalidKeyPath(_))
            ));
        }
        k.model = "claude-v1".into();
        k.group = "/etc".into();
        assert!(cache.checked_shard_path(&k).is_err());
    }

    #[test]
    fn completion_line_format() {
        let k = key(CacheKind::Completion, "Hi", 2);
        let record = CacheRecord::new("Hi", json!("there"), CacheOptions::new());
        let text = serde_json::to_string(&ShardLine::from_record(&k, &record)).unwrap();
        assert_eq!(text, r#"{"prompt":"Hi","tempBucket":2,"opt":{},"completion":"there"}"#);
    }

    #[test]
    fn embedding_line_format() {
        let k = key(CacheKind::Embedding, "Hi", 5);
        let record = CacheRecord::new("Hi", json!([0.5, -0.25]), CacheOptions::new());
        let text = serde_json::to_string(&ShardLine::from_record(&k, &record)).unwrap();
        assert_eq!(text, r#"{"prompt":"Hi","opt":{},"embedding":[0.5,-0.25]}"#);
    }

    #[test]
    fn line_from_other_kind_does_not_match() {
        let k = key(CacheKind::Completion, "Hi", 0);
        let line = ShardLine {
            prompt: "Hi".into(),
            temp_bucket: None,
            opt: CacheOptions::new(),
            completion: None,
            embedding: Some(json!([1.0])),
        };
        assert!(line.into_record_if_match(&k, "Hi").is_none());
    }
}
