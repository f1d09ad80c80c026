//! Benchmarks for cache key derivation
//!
//! This benchmark measures:
//! - Option filtering and canonical serialization
//! - Full key derivation for short and long prompts

use ai_bridge::cache::{canonical_options, CacheKeyDeriver, CacheKind};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn bench_key_derivation(c: &mut Criterion) {
    let deriver = CacheKeyDeriver::new();
    let options = json!({
        "model": "claude-v1",
        "temperature": 0.7,
        "max_tokens": 512,
        "stop": ["\n\nHuman:"],
        "logit_bias": {"50256": -100, "198": -5},
        "stream": true,
        "user": "bench"
    });
    let options = options.as_object().cloned().unwrap_or_default();

    let mut group = c.benchmark_group("cache_key");

    group.bench_function("filter_and_canonicalize", |b| {
        b.iter(|| {
            let filtered = deriver.filter_options(black_box(&options));
            canonical_options(&filtered)
        })
    });

    for (name, prompt) in [
        ("short_prompt", "What is the capital of France?".to_string()),
        ("long_prompt", "lorem ipsum dolor sit amet ".repeat(2000)),
    ] {
        group.throughput(Throughput::Bytes(prompt.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                deriver.derive(
                    CacheKind::Completion,
                    black_box(&prompt),
                    &options,
                    "bench/group",
                    0,
                )
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_key_derivation);
criterion_main!(benches);
