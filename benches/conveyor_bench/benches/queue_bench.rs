//! Queue throughput benchmarks
//!
//! Measures the in-memory driver's push and lease paths through the
//! manager, which is the overhead every backend shares.

use conveyor::{ConnectionConfig, Driver, DispatchOptions, QueueConfig, QueueManager};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use tokio::runtime::Runtime;

fn manager() -> QueueManager {
    let mut config = QueueConfig::default();
    config
        .connections
        .insert("default".to_string(), ConnectionConfig::new("memory"));
    QueueManager::from_config(config).unwrap()
}

/// Benchmark single pushes
fn bench_push(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let queue = manager();
    let data = serde_json::json!({"to": "user@example.com", "subject": "Welcome"});

    c.bench_function("push", |b| {
        b.iter(|| {
            rt.block_on(queue.push(black_box("send_email"), &data, DispatchOptions::new()))
                .unwrap()
        })
    });
}

/// Benchmark batched pushes of different sizes
fn bench_bulk(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bulk");

    for size in [1usize, 10, 100].iter() {
        let jobs = vec!["send_email"; *size];
        group.bench_with_input(BenchmarkId::new("jobs", size), &jobs, |b, jobs| {
            let queue = manager();
            b.iter(|| {
                rt.block_on(queue.bulk(jobs, serde_json::Value::Null, DispatchOptions::new()))
                    .unwrap()
            })
        });
    }

    group.finish();
}

/// Benchmark lease then acknowledge against a backlog
fn bench_lease_ack(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("lease_ack");

    for backlog in [10usize, 1_000].iter() {
        group.bench_with_input(BenchmarkId::new("backlog", backlog), backlog, |b, &backlog| {
            let queue = manager();
            let driver = rt.block_on(queue.connection(None)).unwrap();
            let jobs = vec!["noop"; backlog];
            rt.block_on(queue.bulk(&jobs, serde_json::Value::Null, DispatchOptions::new()))
                .unwrap();

            b.iter(|| {
                rt.block_on(async {
                    let job = driver
                        .dequeue_lease("default", Duration::from_secs(60))
                        .await
                        .unwrap()
                        .unwrap();
                    // Put it straight back so the backlog stays constant
                    driver.release(&job.id, Duration::ZERO).await.unwrap();
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_push, bench_bulk, bench_lease_ack);
criterion_main!(benches);
