//! Storage for jobs that ran out of attempts or failed fatally

use crate::clock::{Clock, SystemClock};
use crate::envelope::Envelope;
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default maximum number of failed jobs kept in memory
const DEFAULT_MAX_HISTORY_SIZE: usize = 10_000;

/// A record of a job that will not be retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: String,
    pub connection: String,
    pub queue: String,
    pub job: Envelope,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait FailedJobProvider: Send + Sync {
    /// Record a failure and return the record id
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        job: &Envelope,
        error: &str,
    ) -> Result<String>;

    /// All recorded failures, oldest first
    async fn all(&self) -> Result<Vec<FailedJob>>;

    async fn find(&self, id: &str) -> Result<Option<FailedJob>>;

    /// Remove one record; returns whether it existed
    async fn forget(&self, id: &str) -> Result<bool>;

    /// Remove every record
    async fn flush(&self) -> Result<()>;
}

/// Bounded in-memory failed job log (oldest entries dropped when full)
#[derive(Debug, Clone)]
pub struct MemoryFailedJobProvider {
    jobs: Arc<Mutex<VecDeque<FailedJob>>>,
    max_history_size: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryFailedJobProvider {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_MAX_HISTORY_SIZE)
    }

    pub fn with_history_limit(max_history_size: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(VecDeque::new())),
            max_history_size: max_history_size.max(1),
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp `failed_at` from the given clock instead of the wall clock
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<FailedJob>>> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::Backend("Lock poisoned".to_string()))
    }
}

impl Default for MemoryFailedJobProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailedJobProvider for MemoryFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        job: &Envelope,
        error: &str,
    ) -> Result<String> {
        let record = FailedJob {
            id: uuid::Uuid::now_v7().to_string(),
            connection: connection.to_string(),
            queue: queue.to_string(),
            job: job.clone(),
            error: error.to_string(),
            failed_at: self.clock.now(),
        };
        let id = record.id.clone();

        let mut jobs = self.lock()?;
        if jobs.len() >= self.max_history_size {
            jobs.pop_front();
        }
        jobs.push_back(record);

        Ok(id)
    }

    async fn all(&self) -> Result<Vec<FailedJob>> {
        Ok(self.lock()?.iter().cloned().collect())
    }

    async fn find(&self, id: &str) -> Result<Option<FailedJob>> {
        Ok(self.lock()?.iter().find(|job| job.id == id).cloned())
    }

    async fn forget(&self, id: &str) -> Result<bool> {
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        Ok(jobs.len() != before)
    }

    async fn flush(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::envelope::Payload;

    fn envelope() -> Envelope {
        let now = Utc::now();
        Envelope::new("default", Payload::new("noop", serde_json::Value::Null), now, now)
    }

    #[tokio::test]
    async fn log_find_forget() {
        let provider = MemoryFailedJobProvider::new();
        let id = provider
            .log("memory", "default", &envelope(), "boom")
            .await
            .unwrap();

        let found = provider.find(&id).await.unwrap().unwrap();
        assert_eq!(found.error, "boom");
        assert_eq!(found.connection, "memory");

        assert!(provider.forget(&id).await.unwrap());
        assert!(!provider.forget(&id).await.unwrap());
        assert!(provider.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_at_follows_clock() {
        let clock = ManualClock::default();
        let provider = MemoryFailedJobProvider::new().with_clock(clock.clone());
        clock.advance(chrono::Duration::hours(3));

        let id = provider
            .log("memory", "default", &envelope(), "boom")
            .await
            .unwrap();

        let found = provider.find(&id).await.unwrap().unwrap();
        assert_eq!(found.failed_at, clock.now());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let provider = MemoryFailedJobProvider::with_history_limit(2);
        for error in ["one", "two", "three"] {
            provider
                .log("memory", "default", &envelope(), error)
                .await
                .unwrap();
        }

        let errors: Vec<String> = provider
            .all()
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.error)
            .collect();
        assert_eq!(errors, vec!["two", "three"]);

        provider.flush().await.unwrap();
        assert!(provider.all().await.unwrap().is_empty());
    }
}
