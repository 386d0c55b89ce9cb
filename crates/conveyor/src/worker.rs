//! Job worker system for processing queued jobs
//!
//! A [`Worker`] leases jobs from one driver, runs them through the
//! [`JobRegistry`] and settles each lease: acknowledge on success, release
//! with a backoff on a recoverable failure, delete once attempts run out or
//! the failure is fatal. No backend lock is held while a handler runs; the
//! lease alone keeps other workers away, and a worker that dies mid-job
//! simply lets the lease expire.

use crate::driver::Driver;
use crate::envelope::Envelope;
use crate::error::{JobError, Result};
use crate::events::{Events, WorkerEvent};
use crate::failed::FailedJobProvider;
use crate::job::JobRegistry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Maximum backoff (24 hours)
const MAX_BACKOFF: Duration = Duration::from_secs(86_400);

/// How the release delay grows with the attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// `base * attempts`
    Linear,
    /// `base * 2^(attempts - 1)`
    Exponential,
}

/// Retry behaviour for recoverable failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Runs allowed before a job is failed for good
    pub max_attempts: u32,
    /// Base delay; `None` uses the connection's `retry_after`
    pub backoff: Option<Duration>,
    pub strategy: BackoffStrategy,
    /// Cap for linear/exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: None,
            strategy: BackoffStrategy::Fixed,
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Delay before the next run of a job that has failed `attempts` times
    pub fn delay_for(&self, attempts: u32, retry_after: Duration) -> Duration {
        let base = self.backoff.unwrap_or(retry_after);
        let attempts = attempts.max(1);

        let calculated = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(attempts),
            BackoffStrategy::Exponential => {
                base.saturating_mul(2_u32.saturating_pow(attempts - 1))
            }
        };

        calculated.min(self.max_backoff)
    }
}

/// Options for a worker loop
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Queues to poll, highest priority first. Empty means the
    /// connection's default queue.
    pub queues: Vec<String>,
    /// Lease length; `None` uses the connection's `retry_after`
    pub lease: Option<Duration>,
    pub retry: RetryPolicy,
    /// First idle sleep when no job is available
    pub sleep: Duration,
    /// Idle sleep doubles up to this bound
    pub max_sleep: Duration,
    /// Pause after a driver error
    pub error_sleep: Duration,
    /// Keep working while the application is down for maintenance
    pub force: bool,
    /// Exit as soon as no job is available
    pub stop_when_empty: bool,
    /// Exit after this many jobs
    pub max_jobs: Option<u64>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            lease: None,
            retry: RetryPolicy::default(),
            sleep: Duration::from_millis(100),
            max_sleep: Duration::from_secs(3),
            error_sleep: Duration::from_secs(1),
            force: false,
            stop_when_empty: false,
            max_jobs: None,
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sleep(mut self, sleep: Duration, max_sleep: Duration) -> Self {
        self.sleep = sleep;
        self.max_sleep = max_sleep.max(sleep);
        self
    }

    pub fn error_sleep(mut self, sleep: Duration) -> Self {
        self.error_sleep = sleep;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn stop_when_empty(mut self, stop: bool) -> Self {
        self.stop_when_empty = stop;
        self
    }

    pub fn max_jobs(mut self, max: u64) -> Self {
        self.max_jobs = Some(max);
        self
    }
}

/// What happened to one leased job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Processed,
    Released { delay: Duration },
    Failed,
}

/// Why a worker loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stopped,
    Empty,
    MaxJobs,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Stopped => "stopped",
            StopReason::Empty => "empty",
            StopReason::MaxJobs => "max_jobs",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cooperative stop signal shared by one or more workers.
///
/// Stopping never interrupts a running job; the loop notices the signal
/// before its next lease.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    signal: Arc<StopSignal>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.signal.stopped.store(true, Ordering::Release);
        self.signal.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.stopped.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early if stopped
    async fn sleep(&self, duration: Duration) {
        let notified = self.signal.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_stopped() {
            return;
        }

        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

/// A single worker that processes jobs from one connection
#[derive(Clone)]
pub struct Worker {
    driver: Arc<dyn Driver>,
    handlers: JobRegistry,
    events: Events,
    options: WorkerOptions,
    failed: Option<Arc<dyn FailedJobProvider>>,
    maintenance: Arc<AtomicBool>,
    stop: StopHandle,
    worker_id: String,
}

impl Worker {
    pub fn new(
        driver: Arc<dyn Driver>,
        handlers: JobRegistry,
        events: Events,
        options: WorkerOptions,
    ) -> Self {
        Self {
            driver,
            handlers,
            events,
            options,
            failed: None,
            maintenance: Arc::new(AtomicBool::new(false)),
            stop: StopHandle::new(),
            worker_id: "worker-0".to_string(),
        }
    }

    /// Record terminal failures in a failed job store
    pub fn with_failed_jobs(mut self, provider: Arc<dyn FailedJobProvider>) -> Self {
        self.failed = Some(provider);
        self
    }

    /// Share a maintenance flag; while set the worker does not lease
    /// unless `force` is on
    pub fn with_maintenance_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.maintenance = flag;
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn named(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    fn connection(&self) -> &str {
        self.driver.connection_name()
    }

    fn queues(&self) -> Vec<String> {
        if self.options.queues.is_empty() {
            vec![self.driver.default_queue().to_string()]
        } else {
            self.options.queues.clone()
        }
    }

    fn lease(&self) -> Duration {
        self.options.lease.unwrap_or_else(|| self.driver.retry_after())
    }

    /// Run until stopped.
    ///
    /// Job failures never end the loop; driver errors are logged and the
    /// loop pauses for `error_sleep` before trying again.
    pub async fn run(&self) -> StopReason {
        let queues = self.queues();
        let mut idle_sleep = self.options.sleep;
        let mut jobs_processed: u64 = 0;

        tracing::info!(
            worker_id = %self.worker_id,
            connection = %self.connection(),
            queues = ?queues,
            "Job worker started"
        );

        let reason = loop {
            if self.stop.is_stopped() {
                break StopReason::Stopped;
            }

            self.events.emit(&WorkerEvent::Looping {
                connection: self.connection().to_string(),
                queues: queues.clone(),
            });

            if self.maintenance.load(Ordering::Acquire) && !self.options.force {
                self.stop.sleep(self.options.sleep).await;
                continue;
            }

            match self.run_next_job().await {
                Ok(Some(_)) => {
                    idle_sleep = self.options.sleep;
                    jobs_processed += 1;
                    if self
                        .options
                        .max_jobs
                        .map_or(false, |max| jobs_processed >= max)
                    {
                        break StopReason::MaxJobs;
                    }
                }
                Ok(None) => {
                    if self.options.stop_when_empty {
                        break StopReason::Empty;
                    }
                    self.stop.sleep(idle_sleep).await;
                    idle_sleep = idle_sleep.saturating_mul(2).min(self.options.max_sleep);
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.worker_id,
                        connection = %self.connection(),
                        error = %e,
                        "Worker error"
                    );
                    self.stop.sleep(self.options.error_sleep).await;
                }
            }
        };

        self.events.emit(&WorkerEvent::Stopping {
            connection: self.connection().to_string(),
            reason: reason.to_string(),
        });
        tracing::info!(
            worker_id = %self.worker_id,
            reason = %reason,
            jobs = jobs_processed,
            "Job worker stopped"
        );

        reason
    }

    /// Lease and process one job from the first queue that has one
    pub async fn run_next_job(&self) -> Result<Option<JobOutcome>> {
        let lease = self.lease();
        for queue in self.queues() {
            if let Some(job) = self.driver.dequeue_lease(&queue, lease).await? {
                return self.process(job).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Run a leased job and settle its lease
    pub async fn process(&self, job: Envelope) -> Result<JobOutcome> {
        let max_attempts = self.options.retry.max_attempts;

        // A job that keeps killing its worker comes back on lease expiry
        // with attempts past the limit; fail it without running it again.
        if job.attempts > max_attempts {
            let error = JobError::fatal(format!(
                "Job {} has been attempted too many times",
                job.id
            ));
            self.fail(job, error).await?;
            return Ok(JobOutcome::Failed);
        }

        tracing::debug!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            job = %job.job_name(),
            queue = %job.queue,
            attempts = job.attempts,
            "Processing job"
        );
        self.events.emit(&WorkerEvent::Processing {
            connection: self.connection().to_string(),
            job: job.clone(),
        });

        match self.handlers.handle(&job, self.connection()).await {
            Ok(()) => {
                self.driver.acknowledge(&job.id).await?;
                tracing::info!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    "Job completed successfully"
                );
                self.events.emit(&WorkerEvent::Processed {
                    connection: self.connection().to_string(),
                    job,
                });
                Ok(JobOutcome::Processed)
            }
            Err(error) if error.is_recoverable() && job.attempts < max_attempts => {
                let delay = self
                    .options
                    .retry
                    .delay_for(job.attempts, self.driver.retry_after());
                self.driver.release(&job.id, delay).await?;
                tracing::warn!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    attempts = job.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, released for retry"
                );
                self.events.emit(&WorkerEvent::ExceptionOccurred {
                    connection: self.connection().to_string(),
                    job,
                    error,
                });
                Ok(JobOutcome::Released { delay })
            }
            Err(error) => {
                self.fail(job, error).await?;
                Ok(JobOutcome::Failed)
            }
        }
    }

    async fn fail(&self, job: Envelope, error: JobError) -> Result<()> {
        self.driver.delete(&job.id).await?;

        if let Some(failed) = &self.failed {
            if let Err(e) = failed
                .log(self.connection(), &job.queue, &job, &error.to_string())
                .await
            {
                tracing::warn!(job_id = %job.id, error = %e, "Could not record failed job");
            }
        }

        tracing::error!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            attempts = job.attempts,
            error = %error,
            "Job failed permanently"
        );
        self.events.emit(&WorkerEvent::Failed {
            connection: self.connection().to_string(),
            job,
            error,
        });
        Ok(())
    }
}

/// Pool of workers that process jobs concurrently
pub struct WorkerPool {
    workers: Vec<tokio::task::JoinHandle<StopReason>>,
    stop: StopHandle,
}

impl WorkerPool {
    /// Spawn `count` copies of `worker` sharing one stop signal
    pub fn spawn(worker: &Worker, count: usize) -> Self {
        let stop = worker.stop_handle();
        let workers = (0..count)
            .map(|i| {
                let worker = worker
                    .clone()
                    .named(format!("worker-{}", i))
                    .with_stop_handle(stop.clone());
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        Self { workers, stop }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit on its own
    pub async fn join(self) -> Vec<StopReason> {
        let mut reasons = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            match worker.await {
                Ok(reason) => reasons.push(reason),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }
        reasons
    }

    /// Signal every worker and wait for in-flight jobs to finish
    pub async fn shutdown(self) -> Vec<StopReason> {
        tracing::info!("Shutting down worker pool...");
        self.stop.stop();
        let reasons = self.join().await;
        tracing::info!("Worker pool shut down");
        reasons
    }
}
