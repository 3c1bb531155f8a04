//! Latency benchmarks for the relay.
//!
//! These benchmarks focus on publish-to-receive latency.

use criterion::{criterion_group, criterion_main, Criterion};
use relay_bench::{drain, registry_with_subscribers, stream_to_discard, text_payload};
use relay_core::BroadcastRegistry;
use std::time::Instant;

/// Benchmark publish + receive on the registry alone.
fn bench_pubsub_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("pubsub_latency");

    group.bench_function("single_subscriber", |b| {
        b.iter_custom(|iters| {
            let (registry, mut subs) = registry_with_subscribers(1, 16);

            let start = Instant::now();
            for _ in 0..iters {
                registry.publish_payload(text_payload(64));
                let _ = subs[0].try_recv();
            }
            start.elapsed()
        });
    });

    group.bench_function("ten_subscribers", |b| {
        b.iter_custom(|iters| {
            let (registry, mut subs) = registry_with_subscribers(10, 16);

            let start = Instant::now();
            for _ in 0..iters {
                registry.publish_payload(text_payload(64));
                drain(&mut subs);
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark a delivery session from publish through the encoded line.
fn bench_session_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_latency");
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    group.bench_function("publish_to_line", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let registry = BroadcastRegistry::new();
                let start = Instant::now();
                stream_to_discard(&registry, iters).await;
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pubsub_latency, bench_session_latency);
criterion_main!(benches);
