//! Backend checks for the durable drivers.
//!
//! Run with a live server, for example:
//! `DATABASE_URL=postgres://... cargo test --features postgres -- --ignored`
//! `REDIS_URL=redis://127.0.0.1/ cargo test --features redis -- --ignored`
#![cfg(any(feature = "redis", feature = "postgres"))]

use conveyor::{Clock, ConnectionConfig, DispatchOptions, Driver, ManualClock, QueueManager};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);

fn manager(connection: ConnectionConfig) -> (QueueManager, ManualClock) {
    let clock = ManualClock::default();
    let manager = QueueManager::builder().clock(clock.clone()).build();
    manager.add_connection("durable", connection).unwrap();
    manager.set_default_connection("durable");
    (manager, clock)
}

/// Queue name unique to one test run
fn fresh_queue() -> String {
    format!("test-{}", uuid::Uuid::now_v7())
}

async fn lease_lifecycle(queue: QueueManager, clock: ManualClock) {
    let name = fresh_queue();
    let on_queue = DispatchOptions::new().queue(name.clone());
    let driver: Arc<dyn Driver> = queue.connection(None).await.unwrap();

    let first = queue.push("first", json!({"n": 1}), on_queue.clone()).await.unwrap();
    let second = queue.push("second", json!({"n": 2}), on_queue.clone()).await.unwrap();
    queue
        .later(60u64, "delayed", json!(null), on_queue.clone())
        .await
        .unwrap();
    assert_eq!(queue.size(on_queue.clone()).await.unwrap(), 3);

    // FIFO among visible jobs, each leased once
    let a = driver.dequeue_lease(&name, LEASE).await.unwrap().unwrap();
    let b = driver.dequeue_lease(&name, LEASE).await.unwrap().unwrap();
    assert_eq!((a.id.as_str(), b.id.as_str()), (first.as_str(), second.as_str()));
    assert_eq!(a.attempts, 1);
    assert_eq!(a.payload.data["n"], 1);
    assert!(driver.dequeue_lease(&name, LEASE).await.unwrap().is_none());

    // Acknowledged jobs are gone; released jobs come back after the delay
    driver.acknowledge(&a.id).await.unwrap();
    driver.release(&b.id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(queue.size(on_queue.clone()).await.unwrap(), 2);

    clock.advance(chrono::Duration::seconds(10));
    let again = driver.dequeue_lease(&name, LEASE).await.unwrap().unwrap();
    assert_eq!(again.id, second);
    assert_eq!(again.attempts, 2);

    // Past both the unsettled lease and the delayed job's start
    clock.advance(chrono::Duration::seconds(50));
    let mut seen = Vec::new();
    while let Some(job) = driver.dequeue_lease(&name, LEASE).await.unwrap() {
        assert!(job.reserved_until.unwrap() > clock.now());
        seen.push(job.job_name().to_string());
        driver.delete(&job.id).await.unwrap();
    }
    seen.sort();
    assert_eq!(seen, vec!["delayed", "second"]);
    assert_eq!(queue.size(on_queue).await.unwrap(), 0);
}

async fn concurrent_leases_are_exclusive(queue: QueueManager) {
    let name = fresh_queue();
    let on_queue = DispatchOptions::new().queue(name.clone());
    let jobs = vec!["job"; 50];
    queue.bulk(&jobs, json!(null), on_queue).await.unwrap();
    let driver = queue.connection(None).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let driver = driver.clone();
        let name = name.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(job) = driver.dequeue_lease(&name, LEASE).await.unwrap() {
                driver.acknowledge(&job.id).await.unwrap();
                ids.push(job.id);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 50);
    assert_eq!(all.len(), 50);
}

#[cfg(feature = "postgres")]
mod postgres_driver {
    use super::*;

    fn connection() -> ConnectionConfig {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        ConnectionConfig::new("database")
            .option("url", url)
            .option("table", "conveyor_test_jobs")
    }

    #[tokio::test]
    #[ignore]
    async fn test_database_lease_lifecycle() {
        let (queue, clock) = manager(connection());
        lease_lifecycle(queue, clock).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_database_concurrent_leases() {
        let (queue, _) = manager(connection());
        concurrent_leases_are_exclusive(queue).await;
    }
}

#[cfg(feature = "redis")]
mod redis_driver {
    use super::*;

    fn connection() -> ConnectionConfig {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        ConnectionConfig::new("redis")
            .option("url", url)
            .option("prefix", "conveyor-test")
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_lease_lifecycle() {
        let (queue, clock) = manager(connection());
        lease_lifecycle(queue, clock).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_redis_concurrent_leases() {
        let (queue, _) = manager(connection());
        concurrent_leases_are_exclusive(queue).await;
    }
}
