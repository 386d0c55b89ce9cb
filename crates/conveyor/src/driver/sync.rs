use super::Driver;
use crate::clock::Clock;
use crate::envelope::Envelope;
use crate::error::{QueueError, Result};
use crate::events::{Events, WorkerEvent};
use crate::job::JobRegistry;
use crate::registry::ConnectorContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Runs each job inline, inside the dispatching call.
///
/// Nothing is stored: a pushed job has either already run or already
/// failed by the time `enqueue` returns, and delays are ignored. A handler
/// failure comes back to the caller as [`QueueError::JobFailed`].
pub struct SyncDriver {
    connection: String,
    queue: String,
    retry_after: Duration,
    handlers: JobRegistry,
    events: Events,
    clock: Arc<dyn Clock>,
}

impl SyncDriver {
    pub fn from_context(ctx: &ConnectorContext) -> Self {
        Self {
            connection: ctx.name.clone(),
            queue: ctx.config.queue.clone(),
            retry_after: ctx.config.retry_after_duration(),
            handlers: ctx.handlers.clone(),
            events: ctx.events.clone(),
            clock: ctx.clock.clone(),
        }
    }
}

/// Connector for the `sync` driver type
pub async fn connect(ctx: ConnectorContext) -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(SyncDriver::from_context(&ctx)))
}

#[async_trait]
impl Driver for SyncDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn driver_type(&self) -> &'static str {
        "sync"
    }

    fn default_queue(&self) -> &str {
        &self.queue
    }

    fn retry_after(&self) -> Duration {
        self.retry_after
    }

    async fn enqueue(&self, mut envelope: Envelope) -> Result<String> {
        envelope.reserve(self.clock.now(), self.retry_after);
        let connection = self.connection.clone();

        self.events.emit(&WorkerEvent::Processing {
            connection: connection.clone(),
            job: envelope.clone(),
        });

        match self.handlers.handle(&envelope, &connection).await {
            Ok(()) => {
                let id = envelope.id.clone();
                self.events.emit(&WorkerEvent::Processed {
                    connection,
                    job: envelope,
                });
                Ok(id)
            }
            Err(error) => {
                tracing::warn!(
                    connection = %connection,
                    job_id = %envelope.id,
                    error = %error,
                    "Sync job failed"
                );
                self.events.emit(&WorkerEvent::Failed {
                    connection,
                    job: envelope,
                    error: error.clone(),
                });
                Err(QueueError::JobFailed(error))
            }
        }
    }

    async fn dequeue_lease(&self, _queue: &str, _lease: Duration) -> Result<Option<Envelope>> {
        Ok(None)
    }

    async fn acknowledge(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _id: &str, _delay: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn size(&self, _queue: &str) -> Result<usize> {
        Ok(0)
    }
}
