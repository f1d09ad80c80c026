//! End-to-end bridge behavior: cache in front of a mock provider.

mod common;

use ai_bridge::cache::{CacheBackend, CacheConfig, CacheManager, JsonlCache};
use ai_bridge::transport::ProviderConfig;
use ai_bridge::{AiBridge, BridgeConfig, CallScope, Error};
use common::{init_tracing, opts, sse_body};
use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::Arc;

fn config(base_url: &str, cache_dir: &std::path::Path) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.cache = CacheConfig::new().with_jsonl_path(cache_dir);
    config.provider = ProviderConfig::new("mock", format!("{}/v1/complete", base_url))
        .with_embedding_url(format!("{}/v1/embeddings", base_url))
        .with_api_key("test-key");
    config
}

#[tokio::test]
async fn second_identical_completion_is_served_from_cache() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/complete")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"completion":"Paris"}"#)
        .expect(1)
        .create_async()
        .await;

    let bridge = AiBridge::from_config(config(&server.url(), dir.path()))
        .await
        .unwrap();
    let options = opts(json!({"model": "claude-v1", "temperature": 0, "max_tokens": 64}));
    let scope = CallScope::new().with_group("geo/capitals");

    let first = bridge
        .completion("Capital of France?", &options, &scope)
        .await
        .unwrap();
    let second = bridge
        .completion("Capital of France?", &options, &scope)
        .await
        .unwrap();

    assert_eq!(first, json!("Paris"));
    assert_eq!(second, first);
    let stats = bridge.cache().stats();
    assert_eq!((stats.hits, stats.misses, stats.stores), (1, 1, 1));
    mock.assert_async().await;
}

#[tokio::test]
async fn streamed_hit_is_replayed_as_one_delta() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/complete")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body(&["Once", "Once upon", "Once upon a time"]))
        .expect(1)
        .create_async()
        .await;

    let bridge = AiBridge::from_config(config(&server.url(), dir.path()))
        .await
        .unwrap();
    let options = opts(json!({"model": "claude-v1", "stream": true, "max_tokens": 32}));

    let mut live = Vec::new();
    let mut sink = |delta: &str, _: &str| live.push(delta.to_string());
    bridge
        .completion_streamed("Begin a story", &options, &CallScope::new(), &mut sink)
        .await
        .unwrap();
    assert_eq!(live, vec!["Once", " upon", " a time"]);

    let mut replayed = Vec::new();
    let mut sink = |delta: &str, cumulative: &str| {
        replayed.push((delta.to_string(), cumulative.to_string()))
    };
    let text = bridge
        .completion_streamed("Begin a story", &options, &CallScope::new(), &mut sink)
        .await
        .unwrap();
    assert_eq!(text, json!("Once upon a time"));
    assert_eq!(
        replayed,
        vec![("Once upon a time".to_string(), "Once upon a time".to_string())]
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn provider_failure_propagates_and_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/complete")
        .with_status(401)
        .with_body("invalid x-api-key")
        .expect(2)
        .create_async()
        .await;

    let bridge = AiBridge::from_config(config(&server.url(), dir.path()))
        .await
        .unwrap();
    let options = opts(json!({"max_tokens": 16}));

    for _ in 0..2 {
        let err = bridge
            .completion("Hello", &options, &CallScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { status: 401, .. }));
    }
    assert_eq!(bridge.cache().stats().stores, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn cache_write_failure_does_not_fail_the_call() {
    init_tracing();
    // A regular file where the cache directory should be: every shard
    // directory creation fails.
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/complete")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"completion":"still answered"}"#)
        .expect(2)
        .create_async()
        .await;

    let cfg = config(&server.url(), std::path::Path::new("unused"));
    let cache = CacheManager::new(
        cfg.cache.clone(),
        vec![Arc::new(JsonlCache::new(blocker.path())) as Arc<dyn CacheBackend>],
    );
    let bridge = AiBridge::builder(cfg).with_cache(cache).build().await.unwrap();
    let options = opts(json!({"max_tokens": 16}));

    for _ in 0..2 {
        let out = bridge
            .completion("Hello", &options, &CallScope::new())
            .await
            .unwrap();
        assert_eq!(out, json!("still answered"));
    }
    let stats = bridge.cache().stats();
    assert_eq!(stats.stores, 0);
    assert_eq!(stats.errors, 2);
    mock.assert_async().await;
}

#[tokio::test]
async fn embeddings_are_cached_per_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/embeddings")
        .match_body(Matcher::PartialJson(json!({"input": "vectorize"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"embedding":[0.5,0.25]}]}"#)
        .expect(1)
        .create_async()
        .await;

    let bridge = AiBridge::from_config(config(&server.url(), dir.path()))
        .await
        .unwrap();
    let options = opts(json!({"model": "text-embedding-ada-002"}));

    let a = bridge.embedding("vectorize", &options, None).await.unwrap();
    let b = bridge
        .embedding("vectorize", &options, None)
        .await
        .unwrap();
    assert_eq!(a, json!([0.5, 0.25]));
    assert_eq!(b, a);
    assert!(dir
        .path()
        .join("text-embedding-ada-002")
        .join("embedding")
        .join("misc/default")
        .exists());
    mock.assert_async().await;
}
