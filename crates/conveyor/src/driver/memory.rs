use super::Driver;
use crate::clock::{Clock, SystemClock};
use crate::envelope::{after, Envelope};
use crate::error::{QueueError, Result};
use crate::registry::ConnectorContext;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    /// Jobs per queue keyed by enqueue sequence
    queues: HashMap<String, BTreeMap<u64, Envelope>>,
    /// Job id -> (queue, sequence)
    index: HashMap<String, (String, u64)>,
}

impl MemoryState {
    fn insert(&mut self, envelope: Envelope) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index
            .insert(envelope.id.clone(), (envelope.queue.clone(), seq));
        self.queues
            .entry(envelope.queue.clone())
            .or_default()
            .insert(seq, envelope);
    }

    fn remove(&mut self, id: &str) -> Option<Envelope> {
        let (queue, seq) = self.index.remove(id)?;
        self.queues.get_mut(&queue)?.remove(&seq)
    }
}

/// In-process queue with real lease semantics (not persistent, for
/// testing/dev and single-process deployments)
#[derive(Debug)]
pub struct MemoryDriver {
    connection: String,
    queue: String,
    retry_after: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    pub fn new(connection: &str, queue: &str, retry_after: Duration) -> Self {
        Self::with_clock(connection, queue, retry_after, Arc::new(SystemClock))
    }

    pub fn with_clock(
        connection: &str,
        queue: &str,
        retry_after: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection: connection.to_string(),
            queue: queue.to_string(),
            retry_after,
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn from_context(ctx: &ConnectorContext) -> Self {
        Self::with_clock(
            &ctx.name,
            &ctx.config.queue,
            ctx.config.retry_after_duration(),
            ctx.clock.clone(),
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("Lock poisoned".to_string()))
    }

    /// Look at a stored job without leasing it
    pub fn peek(&self, id: &str) -> Result<Option<Envelope>> {
        let state = self.lock()?;
        Ok(state
            .index
            .get(id)
            .and_then(|(queue, seq)| state.queues.get(queue)?.get(seq))
            .cloned())
    }
}

/// Connector for the `memory` driver type
pub async fn connect(ctx: ConnectorContext) -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(MemoryDriver::from_context(&ctx)))
}

#[async_trait]
impl Driver for MemoryDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn driver_type(&self) -> &'static str {
        "memory"
    }

    fn default_queue(&self) -> &str {
        &self.queue
    }

    fn retry_after(&self) -> Duration {
        self.retry_after
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<String> {
        let id = envelope.id.clone();
        self.lock()?.insert(envelope);
        Ok(id)
    }

    async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<Vec<String>> {
        let mut state = self.lock()?;
        Ok(envelopes
            .into_iter()
            .map(|envelope| {
                let id = envelope.id.clone();
                state.insert(envelope);
                id
            })
            .collect())
    }

    async fn dequeue_lease(&self, queue: &str, lease: Duration) -> Result<Option<Envelope>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let Some(jobs) = state.queues.get_mut(queue) else {
            return Ok(None);
        };

        let next = jobs
            .iter()
            .filter(|(_, job)| job.is_available(now))
            .min_by_key(|(seq, job)| (job.available_at, **seq))
            .map(|(seq, _)| *seq);

        Ok(next.and_then(|seq| jobs.get_mut(&seq)).map(|job| {
            job.reserve(now, lease);
            job.clone()
        }))
    }

    async fn acknowledge(&self, id: &str) -> Result<()> {
        self.lock()?.remove(id);
        Ok(())
    }

    async fn release(&self, id: &str, delay: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        // Re-inserting gives the job a fresh sequence, so it queues behind
        // jobs that became available at the same instant.
        if let Some(mut job) = state.remove(id) {
            job.available_at = after(now, delay);
            job.reserved_until = None;
            state.insert(job);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.lock()?.remove(id);
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        Ok(self.lock()?.queues.get(queue).map_or(0, BTreeMap::len))
    }
}
