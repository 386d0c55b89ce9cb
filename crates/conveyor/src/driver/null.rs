use super::Driver;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::registry::ConnectorContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Accepts every dispatch and keeps nothing
#[derive(Debug, Clone)]
pub struct NullDriver {
    connection: String,
    queue: String,
}

impl NullDriver {
    pub fn new(connection: &str, queue: &str) -> Self {
        Self {
            connection: connection.to_string(),
            queue: queue.to_string(),
        }
    }
}

/// Connector for the `null` driver type
pub async fn connect(ctx: ConnectorContext) -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(NullDriver::new(&ctx.name, &ctx.config.queue)))
}

#[async_trait]
impl Driver for NullDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn driver_type(&self) -> &'static str {
        "null"
    }

    fn default_queue(&self) -> &str {
        &self.queue
    }

    fn retry_after(&self) -> Duration {
        Duration::ZERO
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<String> {
        tracing::trace!(job_id = %envelope.id, job = %envelope.job_name(), "Discarding job");
        Ok(envelope.id)
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
