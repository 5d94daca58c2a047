//! Codec benchmarks for chorus-protocol.

use chorus_protocol::{codec, ContentKind, Frame};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn message_frame(size: usize) -> Frame {
    Frame::Message {
        message_id: 1,
        group: "team:engineering".into(),
        sender: "alice".into(),
        sequence: 42,
        kind: ContentKind::Text,
        content: "x".repeat(size),
        timestamp: 1_700_000_000_000,
    }
}

fn bench_encode_small(c: &mut Criterion) {
    let frame = message_frame(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("message_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let frame = message_frame(64);
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("message_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = Frame::send(7, "team:engineering", "y".repeat(256));

    c.bench_function("send_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_roundtrip
);
criterion_main!(benches);
