//! Benchmarks for dualproxy components.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dualproxy::config::Protocol;
use dualproxy::metrics::MetricsCollector;
use dualproxy::proxy::{ConnectionRelay, TargetAddr};
use dualproxy::session::SessionTracker;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const PAYLOAD_SIZE: usize = 1024 * 1024;

fn benchmark_target_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("target_addr");

    group.bench_function("parse_domain", |b| {
        b.iter(|| black_box(TargetAddr::parse(black_box("www.example.com:8080"), 80)))
    });

    group.bench_function("parse_ipv6", |b| {
        b.iter(|| black_box(TargetAddr::parse(black_box("[2001:db8::1]:443"), 443)))
    });

    group.finish();
}

fn benchmark_relay(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let payload = vec![0x5au8; PAYLOAD_SIZE];

    let mut group = c.benchmark_group("relay");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));

    group.bench_function("one_way_1mib", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let (client, mut client_peer) = tokio::io::duplex(64 * 1024);
                let (dest, mut dest_peer) = tokio::io::duplex(64 * 1024);
                let relay = ConnectionRelay::new(Duration::from_secs(30));
                let handle = tokio::spawn(async move { relay.run(client, dest).await });

                let payload = payload.clone();
                let writer = tokio::spawn(async move {
                    client_peer.write_all(&payload).await.unwrap();
                    client_peer.shutdown().await.unwrap();
                });

                let mut sink = Vec::with_capacity(PAYLOAD_SIZE);
                dest_peer.read_to_end(&mut sink).await.unwrap();
                writer.await.unwrap();
                black_box(handle.await.unwrap());
            })
        })
    });

    group.finish();
}

fn benchmark_sessions(c: &mut Criterion) {
    let tracker = SessionTracker::new();
    let metrics = MetricsCollector::new();
    let client = "127.0.0.1:40000".parse().unwrap();

    let mut group = c.benchmark_group("sessions");
    group.throughput(Throughput::Elements(1));

    group.bench_function("open_close", |b| {
        b.iter(|| {
            let guard = tracker.open(Protocol::Socks5, client, metrics.clone());
            black_box(guard.id());
        })
    });

    group.bench_function("record_relay", |b| {
        b.iter(|| metrics.record_relay(Protocol::Http, black_box(4096), black_box(65536)))
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_target_parsing,
    benchmark_relay,
    benchmark_sessions,
);
criterion_main!(benches);
