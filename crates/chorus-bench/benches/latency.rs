//! Latency benchmarks for Chorus.
//!
//! These benchmarks measure send-to-receive latency through the core.

use chorus_core::{ChannelSink, ConnectionId, GroupId, Hub, HubConfig, MemoryStore, Message, StaticAuthorizer};
use chorus_protocol::{codec, Frame};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;

/// Benchmark round-trip encode/decode latency.
fn bench_codec_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_roundtrip");

    let frame = Frame::send(1, "team:engineering", "x".repeat(256));

    group.bench_function("256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        });
    });

    group.finish();
}

/// Send through the hub and pull from the subscriber queues.
fn bench_send_receive(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("send_receive");

    for subscribers in [1usize, 10] {
        group.bench_function(format!("{subscribers}_subscribers"), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let members = (0..subscribers).map(|i| format!("user-{i}"));
                    let auth = StaticAuthorizer::new().with_group("room", members);
                    let sink = Arc::new(ChannelSink::new(1024));
                    let config = HubConfig {
                        auto_join: true,
                        ..HubConfig::default()
                    };
                    let hub = Hub::with_config(
                        Arc::new(auth),
                        Arc::new(MemoryStore::with_retention(16)),
                        sink.clone(),
                        config,
                    );

                    let mut queues = Vec::with_capacity(subscribers);
                    for i in 0..subscribers {
                        let conn = format!("conn-{i}");
                        queues.push(sink.register(conn.as_str().into()));
                        hub.on_connect(conn.into(), format!("user-{i}").into())
                            .await
                            .unwrap();
                    }

                    let sender = ConnectionId::from("conn-0");
                    let room = GroupId::from("room");
                    let start = Instant::now();
                    for _ in 0..iters {
                        hub.on_client_message(&sender, &room, "ping").await.unwrap();
                        for queue in &mut queues {
                            let _ = queue.try_recv();
                        }
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

/// Benchmark message creation latency.
fn bench_message_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_creation");

    group.bench_function("simple", |b| {
        b.iter(|| Message::new(black_box("room"), black_box("alice"), black_box("hello")))
    });

    group.bench_function("with_source", |b| {
        b.iter(|| {
            Message::new(black_box("room"), black_box("alice"), black_box("hello"))
                .with_source(black_box("conn-123"))
        })
    });

    group.finish();
}

/// Benchmark membership lookups on a populated hub.
fn bench_subscription_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("subscription_lookup");

    // 1000 groups with 10 connections each
    let mut auth = StaticAuthorizer::new();
    for i in 0..1000 {
        auth = auth.with_group(format!("group:{i}"), (0..10).map(|j| format!("user:{i}:{j}")));
    }
    let hub = Hub::new(
        Arc::new(auth),
        Arc::new(MemoryStore::new()),
        Arc::new(ChannelSink::new(1)),
    );
    rt.block_on(async {
        for i in 0..1000 {
            for j in 0..10 {
                hub.on_connect(format!("conn:{i}:{j}").into(), format!("user:{i}:{j}").into())
                    .await
                    .unwrap();
            }
        }
    });

    group.bench_function("is_subscribed", |b| {
        let mut i = 0;
        b.iter(|| {
            let target = GroupId::new(format!("group:{}", i % 1000));
            let conn = ConnectionId::new(format!("conn:{}:{}", i % 1000, i % 10));
            i += 1;
            hub.membership().is_subscribed(black_box(&target), black_box(&conn))
        });
    });

    group.bench_function("subscribers_of", |b| {
        let mut i = 0;
        b.iter(|| {
            let target = GroupId::new(format!("group:{}", i % 1000));
            i += 1;
            hub.membership().subscribers_of(black_box(&target))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_codec_roundtrip,
    bench_send_receive,
    bench_message_creation,
    bench_subscription_lookup,
);
criterion_main!(benches);
