//! Benchmarks for streamed response decoding
//!
//! This benchmark measures:
//! - Single frame classification
//! - Whole-stream decoding at different chunk sizes

use ai_bridge::stream::{parse_frame, StreamState};
use ai_bridge::{BoxStream, NoopSink, StreamDecoder};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn stream_body(frames: usize) -> String {
    let mut text = String::new();
    let mut body = String::new();
    for i in 0..frames {
        text.push_str(&format!(" token{}", i));
        body.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({ "completion": text, "stop_reason": null })
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_frames");
    let frame = r#"data: {"completion":" Hello there, how can I help you today?","stop_reason":null}"#;
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("parse_single_frame", |b| b.iter(|| parse_frame(black_box(frame))));
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let body = stream_body(200);
    let mut group = c.benchmark_group("stream_decode");
    group.throughput(Throughput::Bytes(body.len() as u64));

    for chunk in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("push", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut state = StreamState::new();
                for piece in body.as_bytes().chunks(chunk) {
                    let _ = state.push(piece, &mut NoopSink);
                }
                state.finish(&mut NoopSink)
            })
        });
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    group.bench_function("decode_async", |b| {
        b.to_async(&rt).iter(|| async {
            let chunks: Vec<ai_bridge::Result<Bytes>> = body
                .as_bytes()
                .chunks(512)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let input: BoxStream<'static, Bytes> = Box::pin(futures::stream::iter(chunks));
            StreamDecoder::new().decode(input, &mut NoopSink).await
        })
    });

    group.finish();
}

criterion_group!(benches, bench_frames, bench_decode);
criterion_main!(benches);
