use async_trait::async_trait;
use conveyor::{
    Clock, ConfigRepository, ConfigSource, ConnectionConfig, Delay, DispatchOptions, Driver, Job,
    JobContext, JobError, ManualClock, MemoryDriver, QueueConfig, QueueError, QueueManager,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct EmailJobData {
    to: String,
    subject: String,
}

#[derive(Clone, Default)]
struct EmailJob {
    sent: Arc<Mutex<Vec<EmailJobData>>>,
}

#[async_trait]
impl Job for EmailJob {
    const NAME: &'static str = "email_job";
    type Data = EmailJobData;

    async fn execute(&self, _ctx: JobContext, data: Self::Data) -> Result<(), JobError> {
        if data.to.is_empty() {
            return Err(JobError::fatal("missing recipient"));
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }
}

fn email(to: &str) -> EmailJobData {
    EmailJobData {
        to: to.to_string(),
        subject: "Welcome".to_string(),
    }
}

fn manager() -> (QueueManager, ManualClock) {
    let config = QueueConfig::from_json(
        r#"{
            "default": "memory",
            "connections": {
                "memory": {"driver": "memory", "retry_after": 30},
                "sync": {"driver": "sync"},
                "discard": {"driver": "null"}
            }
        }"#,
    )
    .unwrap();

    let clock = ManualClock::default();
    let manager = QueueManager::builder()
        .config(config.into_repository().unwrap())
        .clock(clock.clone())
        .build();
    (manager, clock)
}

#[tokio::test]
async fn test_push_then_lease_returns_the_job() {
    let (queue, _) = manager();

    let id = queue
        .dispatch::<EmailJob>(email("user@example.com"), DispatchOptions::new())
        .await
        .expect("Enqueue failed");
    assert!(!id.is_empty());

    let driver = queue.connection(None).await.unwrap();
    let job = driver.dequeue_lease("default", LEASE).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.job_name(), "email_job");
    assert_eq!(job.attempts, 1);

    let data: EmailJobData = serde_json::from_value(job.payload.data).unwrap();
    assert_eq!(data, email("user@example.com"));
}

#[tokio::test]
async fn test_delay_forms_agree() {
    let (queue, clock) = manager();
    let start = clock.now();

    queue
        .later(Delay::Seconds(60), "a", json!(null), DispatchOptions::new())
        .await
        .unwrap();
    queue
        .later(Duration::from_secs(60), "b", json!(null), DispatchOptions::new())
        .await
        .unwrap();
    queue
        .later(
            start + chrono::Duration::seconds(60),
            "c",
            json!(null),
            DispatchOptions::new(),
        )
        .await
        .unwrap();

    let driver = queue.connection(None).await.unwrap();
    clock.advance(chrono::Duration::seconds(59));
    assert!(driver.dequeue_lease("default", LEASE).await.unwrap().is_none());

    clock.advance(chrono::Duration::seconds(1));
    let mut names = Vec::new();
    while let Some(job) = driver.dequeue_lease("default", LEASE).await.unwrap() {
        assert_eq!(job.available_at, start + chrono::Duration::seconds(60));
        names.push(job.job_name().to_string());
    }
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_connection_resolves_once_and_reports_connected() {
    let (queue, _) = manager();
    let builds = Arc::new(AtomicUsize::new(0));

    let counter = builds.clone();
    queue.extend("memory", move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(Arc::new(MemoryDriver::from_context(&ctx)) as Arc<dyn Driver>) }
    });

    assert!(!queue.connected(Some("memory")));
    let first = queue.connection(Some("memory")).await.unwrap();
    let second = queue.connection(Some("memory")).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(queue.connected(Some("memory")));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_connection_and_driver() {
    let (queue, _) = manager();

    let err = queue
        .push("job", json!(null), DispatchOptions::new().connection("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Configuration(_)));

    queue
        .add_connection("sqs", ConnectionConfig::new("sqs"))
        .unwrap();
    let err = queue
        .push("job", json!(null), DispatchOptions::new().connection("sqs"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::UnknownDriver(ref driver) if driver == "sqs"));
    assert!(!queue.connected(Some("sqs")));
}

#[tokio::test]
async fn test_sync_driver_runs_inline() {
    let (queue, _) = manager();
    let job = EmailJob::default();
    queue.register_job(job.clone()).await;

    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    queue.after(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let sync = DispatchOptions::new().connection("sync");
    queue
        .dispatch::<EmailJob>(email("user@example.com"), sync.clone())
        .await
        .unwrap();

    assert_eq!(job.sent.lock().unwrap().len(), 1);
    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert_eq!(queue.size(sync).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sync_driver_returns_handler_failure() {
    let (queue, _) = manager();
    queue.register_job(EmailJob::default()).await;

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    queue.failing(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let err = queue
        .dispatch::<EmailJob>(email(""), DispatchOptions::new().connection("sync"))
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::JobFailed(JobError::Fatal(_))));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_failure_is_terminal_only() {
    let (queue, _) = manager();
    queue.register_job(EmailJob::default()).await;

    let exceptions = Arc::new(AtomicUsize::new(0));
    let counter = exceptions.clone();
    queue.exception_occurred(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    queue.failing(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    queue
        .dispatch::<EmailJob>(email(""), DispatchOptions::new().connection("sync"))
        .await
        .unwrap_err();

    // Sync jobs get a single attempt, so there is no retryable exception
    assert_eq!(exceptions.load(Ordering::SeqCst), 0);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

struct ExplodingJob;

#[async_trait]
impl Job for ExplodingJob {
    const NAME: &'static str = "exploding_job";
    type Data = ();

    async fn execute(&self, _ctx: JobContext, _data: ()) -> Result<(), JobError> {
        panic!("kaboom");
    }
}

#[tokio::test]
async fn test_sync_driver_reports_panic_as_failure() {
    let (queue, _) = manager();
    queue.register_job(ExplodingJob).await;

    let err = queue
        .dispatch::<ExplodingJob>((), DispatchOptions::new().connection("sync"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        QueueError::JobFailed(JobError::Fatal(ref message)) if message == "job panicked: kaboom"
    ));
}

#[tokio::test]
async fn test_null_driver_discards() {
    let (queue, _) = manager();
    let discard = DispatchOptions::new().connection("discard");

    let id = queue.push("job", json!({}), discard.clone()).await.unwrap();
    assert!(!id.is_empty());
    assert_eq!(queue.size(discard).await.unwrap(), 0);

    // The `null` name needs no configuration entry
    let driver = queue.connection(Some("null")).await.unwrap();
    assert_eq!(driver.driver_type(), "null");
}

#[tokio::test]
async fn test_shared_config_source_sees_runtime_changes() {
    let config = ConfigRepository::new();
    let queue = QueueManager::builder()
        .config(config.clone())
        .clock(ManualClock::default())
        .build();

    config.set(
        "queue.connections.jobs",
        serde_json::to_value(ConnectionConfig::new("memory").queue("work")).unwrap(),
    );
    config.set("queue.default", json!("jobs"));

    queue.push("job", json!(null), DispatchOptions::new()).await.unwrap();
    assert_eq!(
        queue
            .size(DispatchOptions::new().queue("work"))
            .await
            .unwrap(),
        1
    );
}
