use crate::envelope::Envelope;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod null;
pub mod sync;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "postgres")]
pub mod database;

/// Storage contract every queue backend implements.
///
/// Drivers are built once per connection name by the registry and shared
/// by every caller of that connection, so all methods take `&self`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name of the connection this driver was built for
    fn connection_name(&self) -> &str;

    /// Driver type string the connector was registered under
    fn driver_type(&self) -> &'static str;

    /// Queue used when a dispatch does not name one
    fn default_queue(&self) -> &str;

    /// Lease length taken by workers that do not set their own
    fn retry_after(&self) -> Duration;

    /// Record a job. It becomes leasable once `available_at` has passed.
    ///
    /// Returns the id the backend will use for the job.
    async fn enqueue(&self, envelope: Envelope) -> Result<String>;

    /// Record several jobs.
    ///
    /// Equivalent to sequential `enqueue` calls; backends may write them
    /// in one round trip but nothing guarantees all-or-nothing.
    async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            ids.push(self.enqueue(envelope).await?);
        }
        Ok(ids)
    }

    /// Atomically claim the oldest visible job on `queue`.
    ///
    /// The claimed job has its attempt count bumped and stays hidden from
    /// other callers until `now + lease`.
    async fn dequeue_lease(&self, queue: &str, lease: Duration) -> Result<Option<Envelope>>;

    /// The job finished; forget it
    async fn acknowledge(&self, id: &str) -> Result<()>;

    /// Put a leased job back, visible again after `delay`
    async fn release(&self, id: &str, delay: Duration) -> Result<()>;

    /// Remove a job whatever its state
    async fn delete(&self, id: &str) -> Result<()>;

    /// Pending plus reserved jobs on `queue`
    async fn size(&self, queue: &str) -> Result<usize>;
}
