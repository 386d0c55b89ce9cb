use crate::envelope::Envelope;
use crate::error::JobError;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Context passed to job execution
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub connection: String,
    pub queue: String,
    /// 1 on the first run
    pub attempt: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A job that can be executed
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// The job name/type
    const NAME: &'static str;

    /// The data required by the job
    type Data: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// Execute the job
    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<(), JobError>;
}

/// A type-erased job handler
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<(), JobError>;
}

#[async_trait]
impl<J: Job> JobHandler for J {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<(), JobError> {
        // Bad arguments will never decode on a later attempt either
        let data: J::Data = serde_json::from_value(data)
            .map_err(|e| JobError::fatal(format!("Invalid data for job {}: {}", J::NAME, e)))?;
        self.execute(ctx, data).await
    }
}

/// Maps payload type tags to their handlers.
///
/// Cheap to clone; all clones share one table.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler under `J::NAME`
    pub async fn register_job<J: Job>(&self, job: J) {
        self.register(J::NAME, job).await;
    }

    /// Register a handler under an arbitrary type tag
    pub async fn register<H: JobHandler + 'static>(&self, name: &str, handler: H) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    pub async fn registered_types(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Run the handler for a leased envelope.
    ///
    /// A missing handler is fatal: no amount of retrying will produce one.
    pub async fn handle(&self, envelope: &Envelope, connection: &str) -> Result<(), JobError> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(envelope.job_name()).cloned()
        };

        let Some(handler) = handler else {
            return Err(JobError::fatal(format!(
                "No handler for job: {}",
                envelope.job_name()
            )));
        };

        let ctx = JobContext {
            job_id: envelope.id.clone(),
            connection: connection.to_string(),
            queue: envelope.queue.clone(),
            attempt: envelope.attempts,
            created_at: envelope.created_at,
        };

        // A panicking handler fails its job instead of taking the worker down
        AssertUnwindSafe(handler.handle(ctx, envelope.payload.data.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(JobError::fatal(format!(
                    "job panicked: {}",
                    panic_message(panic.as_ref())
                )))
            })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
