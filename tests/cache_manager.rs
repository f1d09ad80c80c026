//! CacheManager fan-out over instrumented and real backends.

mod common;

use ai_bridge::cache::{
    CacheBackend, CacheConfig, CacheError, CacheKey, CacheKind, CacheManager, CacheRecord,
    JsonlCache, MemoryDocumentStore, RemoteCache,
};
use async_trait::async_trait;
use common::{init_tracing, opts};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_test::assert_ok;

/// Backend with scripted answers that counts every call.
struct Instrumented {
    name: &'static str,
    hit: Option<Value>,
    fail_lookup: bool,
    fail_store: bool,
    lookups: AtomicUsize,
    stores: AtomicUsize,
}

impl Instrumented {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            hit: None,
            fail_lookup: false,
            fail_store: false,
            lookups: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
        }
    }

    fn hitting(mut self, value: Value) -> Self {
        self.hit = Some(value);
        self
    }

    fn failing_lookup(mut self) -> Self {
        self.fail_lookup = true;
        self
    }

    fn failing_store(mut self) -> Self {
        self.fail_store = true;
        self
    }
}

#[async_trait]
impl CacheBackend for Instrumented {
    async fn lookup(&self, _key: &CacheKey, prompt: &str) -> ai_bridge::Result<Option<CacheRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookup {
            return Err(CacheError::Remote("lookup refused".into()).into());
        }
        Ok(self
            .hit
            .clone()
            .map(|response| CacheRecord::new(prompt, response, Default::default())))
    }

    async fn store(&self, _key: &CacheKey, _record: &CacheRecord) -> ai_bridge::Result<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.fail_store {
            return Err(CacheError::Remote("store refused".into()).into());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

fn manager(backends: &[Arc<Instrumented>]) -> CacheManager {
    let backends = backends
        .iter()
        .map(|b| b.clone() as Arc<dyn CacheBackend>)
        .collect();
    CacheManager::new(CacheConfig::default(), backends)
}

#[tokio::test]
async fn lookup_stops_at_first_hit() {
    let first = Arc::new(Instrumented::new("first"));
    let second = Arc::new(Instrumented::new("second").hitting(json!("from second")));
    let third = Arc::new(Instrumented::new("third").hitting(json!("from third")));
    let cache = manager(&[first.clone(), second.clone(), third.clone()]);

    let hit = cache
        .lookup(CacheKind::Completion, "q", &opts(json!({})), "g", 0)
        .await;
    assert_eq!(hit, Some(json!("from second")));
    assert_eq!(first.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(second.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(third.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn lookup_fault_is_a_miss_for_that_backend() {
    init_tracing();
    let broken = Arc::new(Instrumented::new("broken").failing_lookup());
    let healthy = Arc::new(Instrumented::new("healthy").hitting(json!(42)));
    let cache = manager(&[broken.clone(), healthy.clone()]);

    let hit = cache
        .lookup(CacheKind::Completion, "q", &opts(json!({})), "g", 0)
        .await;
    assert_eq!(hit, Some(json!(42)));
    let stats = cache.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn store_writes_through_despite_failures() {
    let broken = Arc::new(Instrumented::new("broken").failing_store());
    let healthy = Arc::new(Instrumented::new("healthy"));
    let cache = manager(&[broken.clone(), healthy.clone()]);

    let outcome = cache
        .store(CacheKind::Completion, "q", &json!("a"), &opts(json!({})), "g", 0)
        .await;
    assert!(!outcome.is_complete());
    assert_eq!(outcome.written, vec!["healthy"]);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].0, "broken");
    assert_eq!(broken.stores.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.stores.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_kind_never_touches_backends() {
    let backend = Arc::new(Instrumented::new("only").hitting(json!("cached")));
    let cache = CacheManager::new(
        CacheConfig::default().with_embedding(false),
        vec![backend.clone() as Arc<dyn CacheBackend>],
    );

    assert!(cache
        .lookup(CacheKind::Embedding, "q", &opts(json!({})), "g", 0)
        .await
        .is_none());
    let outcome = cache
        .store(CacheKind::Embedding, "q", &json!([1.0]), &opts(json!({})), "g", 0)
        .await;
    assert!(outcome.written.is_empty());
    assert_eq!(backend.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(backend.stores.load(Ordering::SeqCst), 0);

    // Completions are still served.
    assert!(cache
        .lookup(CacheKind::Completion, "q", &opts(json!({})), "g", 0)
        .await
        .is_some());
}

#[tokio::test]
async fn jsonl_and_remote_share_write_through() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryDocumentStore::new());
    let remote: Arc<dyn CacheBackend> = Arc::new(RemoteCache::new(store.clone()));
    let local: Arc<dyn CacheBackend> = Arc::new(JsonlCache::new(dir.path()));

    let cache = CacheManager::new(CacheConfig::default(), vec![local, remote.clone()]);
    assert_ok!(cache.setup().await);
    assert_eq!(cache.backend_names(), vec!["jsonl", "remote"]);

    let options = opts(json!({"model": "claude-v1", "temperature": 0}));
    let outcome = cache
        .store(CacheKind::Completion, "shared", &json!("yes"), &options, "g", 0)
        .await;
    assert!(outcome.is_complete());
    assert_eq!(store.count("completion_claude-v1").await, 1);

    // A manager that only sees the remote store gets the same answer.
    let remote_only = CacheManager::new(CacheConfig::default(), vec![remote]);
    let hit = remote_only
        .lookup(CacheKind::Completion, "shared", &options, "g", 0)
        .await;
    assert_eq!(hit, Some(json!("yes")));
}

#[tokio::test]
async fn allow_list_decides_what_splits_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheManager::from_config(&CacheConfig::new().with_jsonl_path(dir.path())).unwrap();

    let stored = opts(json!({"model": "m", "temperature": 0, "stream": false}));
    cache
        .store(CacheKind::Completion, "p", &json!("r"), &stored, "g", 0)
        .await;

    let streamed = opts(json!({"model": "m", "temperature": 0, "stream": true, "user": "x"}));
    assert_eq!(
        cache.lookup(CacheKind::Completion, "p", &streamed, "g", 0).await,
        Some(json!("r"))
    );
    let hotter = opts(json!({"model": "m", "temperature": 0.1}));
    assert!(cache
        .lookup(CacheKind::Completion, "p", &hotter, "g", 0)
        .await
        .is_none());
    assert!((cache.stats().hit_ratio() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn remote_without_url_fails_construction() {
    let mut config = CacheConfig::default();
    config.remote.enabled = true;
    let result = CacheManager::from_config(&config);
    assert!(matches!(result, Err(ai_bridge::Error::Configuration { .. })));
}
