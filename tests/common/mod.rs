//! Shared helpers for integration tests.
#![allow(dead_code)]

use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG=ai_bridge=debug` shows bridge logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn opts(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Render SSE frames the way streaming providers send them.
pub fn sse_body(cumulative: &[&str]) -> String {
    let mut body = String::new();
    for text in cumulative {
        body.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({ "completion": text, "stop_reason": null })
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}
