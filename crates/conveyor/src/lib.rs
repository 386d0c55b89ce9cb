//! Multi-backend job queue broker
//!
//! Jobs are pushed through a [`QueueManager`] onto named connections. Each
//! connection is backed by a [`Driver`] built lazily from configuration:
//! `sync` runs jobs inline, `null` discards them, `memory` keeps them in
//! process, and the `redis` and `postgres` features add durable backends.
//! [`Worker`]s lease jobs with a visibility timeout, so delivery is at least
//! once: a job whose worker dies comes back when its lease expires.
//!
//! ```no_run
//! use conveyor::{ConnectionConfig, DispatchOptions, QueueConfig, QueueManager, WorkerOptions};
//!
//! # async fn run() -> conveyor::Result<()> {
//! let mut config = QueueConfig::default();
//! config.connections.insert("default".into(), ConnectionConfig::new("memory"));
//!
//! let queue = QueueManager::from_config(config)?;
//! queue
//!     .push("send_email", serde_json::json!({"to": "user@example.com"}), DispatchOptions::new())
//!     .await?;
//!
//! let worker = queue.worker(None, WorkerOptions::new().stop_when_empty(true)).await?;
//! worker.run().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod events;
pub mod failed;
pub mod job;
pub mod manager;
pub mod registry;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigRepository, ConfigSource, ConnectionConfig, QueueConfig};
pub use driver::memory::MemoryDriver;
pub use driver::Driver;
pub use envelope::{Delay, Envelope, JobState, Payload};
pub use error::{JobError, QueueError, Result};
pub use events::{EventKind, Events, WorkerEvent};
pub use failed::{FailedJob, FailedJobProvider, MemoryFailedJobProvider};
pub use job::{Job, JobContext, JobHandler, JobRegistry};
pub use manager::{DispatchOptions, QueueManager, QueueManagerBuilder};
pub use registry::{ConnectionRegistry, ConnectorContext};
pub use worker::{
    BackoffStrategy, JobOutcome, RetryPolicy, StopHandle, StopReason, Worker, WorkerOptions,
    WorkerPool,
};

#[cfg(feature = "postgres")]
pub use driver::database::DatabaseDriver;
#[cfg(feature = "redis")]
pub use driver::redis::RedisDriver;
