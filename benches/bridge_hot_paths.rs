//! Criterion benchmarks for the per-message hot paths of the bridge.
//!
//! Run with: `cargo bench --bench bridge_hot_paths`
//! Run specific: `cargo bench --bench bridge_hot_paths -- frame_codec`
//!
//! Every relayed call passes through validation, one frame encode and
//! decode, and a register/resolve pair on the pending table.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Value, json};
use std::hint::black_box;
use tweety::bridge::pending::PendingCalls;
use tweety::bridge::protocol::{self, MAX_HOST_MESSAGE_BYTES, RpcResponse};

const PAYLOAD_SIZES: &[usize] = &[256, 4096, 65536];

fn request_with_payload(bytes: usize) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": "bench-1",
        "method": "tabs.query",
        "params": [{"title": "x".repeat(bytes)}]
    })
}

// ============================================================================
// Validation
// ============================================================================

fn bench_validation(c: &mut Criterion) {
    let request = request_with_payload(256);
    let response = RpcResponse::success("bench-1", json!({"ok": true})).to_value();
    let garbage = json!({"jsonrpc": "1.0", "id": 7, "method": null});

    let mut group = c.benchmark_group("validation");
    group.throughput(Throughput::Elements(1));
    group.bench_function("is_request", |b| {
        b.iter(|| black_box(protocol::is_request(black_box(&request))));
    });
    group.bench_function("is_response", |b| {
        b.iter(|| black_box(protocol::is_response(black_box(&response))));
    });
    group.bench_function("reject_garbage", |b| {
        b.iter(|| {
            black_box(protocol::is_request(black_box(&garbage)))
                || black_box(protocol::is_response(black_box(&garbage)))
        });
    });
    group.finish();
}

// ============================================================================
// Native frames
// ============================================================================

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    for &size in PAYLOAD_SIZES {
        let message = request_with_payload(size);
        let frame = protocol::encode_frame(&message, MAX_HOST_MESSAGE_BYTES).expect("encode");
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &message, |b, message| {
            b.iter(|| protocol::encode_frame(black_box(message), MAX_HOST_MESSAGE_BYTES));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| protocol::decode_frame::<Value>(black_box(frame), MAX_HOST_MESSAGE_BYTES));
        });
    }
    group.finish();
}

// ============================================================================
// Correlation
// ============================================================================

fn bench_pending_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending_correlation");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_resolve", |b| {
        let calls = PendingCalls::new();
        let mut n = 0_u64;
        b.iter(|| {
            n += 1;
            let id = format!("call-{n}");
            let call = calls.register(id.as_str(), None).expect("register");
            black_box(calls.resolve(RpcResponse::success(id, Value::Null)));
            drop(call);
        });
    });

    // Resolution cost with many unrelated calls in flight.
    group.bench_function("resolve_among_1024", |b| {
        let calls = PendingCalls::new();
        let _background: Vec<_> = (0..1024)
            .map(|i| calls.register(format!("bg-{i}"), None).expect("register"))
            .collect();
        b.iter(|| {
            let call = calls.register("hot", None).expect("register");
            black_box(calls.resolve(RpcResponse::success("hot", Value::Null)));
            drop(call);
        });
    });
    group.finish();
}

criterion_group!(
    bridge_benches,
    bench_validation,
    bench_frame_codec,
    bench_pending_correlation
);
criterion_main!(bridge_benches);
