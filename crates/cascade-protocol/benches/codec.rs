//! Codec benchmarks for cascade-protocol.

use cascade_protocol::{codec, Frame, Packet, Reply};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn bench_encode_publish(c: &mut Criterion) {
    let frame = Frame::Packet(Packet::new(
        "#publish",
        Some(json!({"channel": "chat:lobby", "data": "x".repeat(64)})),
    ));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("publish_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_publish(c: &mut Criterion) {
    let frame = Frame::Packet(Packet::new(
        "#publish",
        Some(json!({"channel": "chat:lobby", "data": "x".repeat(64)})),
    ));
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("publish_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_reply_roundtrip(c: &mut Criterion) {
    let frame = Frame::Reply(Reply::ok(42, Some(json!({"id": "socket", "ok": true}))));

    c.bench_function("reply_roundtrip", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_publish,
    bench_decode_publish,
    bench_reply_roundtrip
);
criterion_main!(benches);
