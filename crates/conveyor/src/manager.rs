//! Queue manager: the broker callers dispatch through
//!
//! Routes each dispatch to a driver by connection name, stamps the
//! envelope with the manager's clock and hands workers everything they
//! share with the broker (handlers, events, maintenance flag, failed job
//! store).

use crate::clock::{Clock, SystemClock};
use crate::config::{
    ConfigRepository, ConfigSource, ConnectionConfig, QueueConfig, CONNECTIONS_KEY, DEFAULT_KEY,
};
use crate::driver::{self, Driver};
use crate::envelope::{Delay, Envelope, Payload};
use crate::error::Result;
use crate::events::{EventKind, Events, WorkerEvent};
use crate::failed::FailedJobProvider;
use crate::job::{Job, JobRegistry};
use crate::registry::{ConnectionRegistry, ConnectorContext};
use crate::worker::{Worker, WorkerOptions};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Connection used when `queue.default` is not set
const FALLBACK_CONNECTION: &str = "default";

/// Where a dispatch goes
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Queue name; the connection's default queue when unset
    pub queue: Option<String>,
    /// Connection name; the default connection when unset
    pub connection: Option<String>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }
}

/// Builder for [`QueueManager`]
#[derive(Default)]
pub struct QueueManagerBuilder {
    config: Option<Arc<dyn ConfigSource>>,
    clock: Option<Arc<dyn Clock>>,
    handlers: Option<JobRegistry>,
    failed: Option<Arc<dyn FailedJobProvider>>,
}

impl QueueManagerBuilder {
    pub fn config<C: ConfigSource + 'static>(mut self, config: C) -> Self {
        self.config = Some(Arc::new(config));
        self
    }

    pub fn config_source(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn handlers(mut self, handlers: JobRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn failed_jobs<P: FailedJobProvider + 'static>(mut self, provider: P) -> Self {
        self.failed = Some(Arc::new(provider));
        self
    }

    pub fn build(self) -> QueueManager {
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(ConfigRepository::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let handlers = self.handlers.unwrap_or_default();
        let events = Events::new();

        let registry =
            ConnectionRegistry::new(config.clone(), handlers.clone(), events.clone(), clock.clone());
        registry.register("null", driver::null::connect);
        registry.register("sync", driver::sync::connect);
        registry.register("memory", driver::memory::connect);
        #[cfg(feature = "redis")]
        registry.register("redis", driver::redis::connect);
        #[cfg(feature = "postgres")]
        registry.register("database", driver::database::connect);

        QueueManager {
            registry,
            config,
            handlers,
            events,
            clock,
            maintenance: Arc::new(AtomicBool::new(false)),
            failed: self.failed,
        }
    }
}

/// Main queue manager
#[derive(Clone)]
pub struct QueueManager {
    registry: ConnectionRegistry,
    config: Arc<dyn ConfigSource>,
    handlers: JobRegistry,
    events: Events,
    clock: Arc<dyn Clock>,
    maintenance: Arc<AtomicBool>,
    failed: Option<Arc<dyn FailedJobProvider>>,
}

impl QueueManager {
    /// Manager over a config source, with the wall clock
    pub fn new<C: ConfigSource + 'static>(config: C) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::default()
    }

    /// Manager over a typed configuration
    pub fn from_config(config: QueueConfig) -> Result<Self> {
        Ok(Self::new(config.into_repository()?))
    }

    /// Manager over the `QUEUE_*` environment
    #[cfg(feature = "env")]
    pub fn from_env() -> Result<Self> {
        Self::from_config(QueueConfig::from_env()?)
    }

    // --- Connections ---

    /// Name of the default connection
    pub fn default_connection(&self) -> String {
        self.config
            .get(DEFAULT_KEY)
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| FALLBACK_CONNECTION.to_string())
    }

    pub fn set_default_connection(&self, name: &str) {
        self.config.set(DEFAULT_KEY, Value::String(name.to_string()));
    }

    /// Full connection name, resolving `None` to the default
    pub fn connection_name(&self, name: Option<&str>) -> String {
        name.map(str::to_string)
            .unwrap_or_else(|| self.default_connection())
    }

    /// Resolve a connection, building its driver on first use
    pub async fn connection(&self, name: Option<&str>) -> Result<Arc<dyn Driver>> {
        let name = self.connection_name(name);
        self.registry.resolve(&name).await
    }

    /// Whether a connection has been resolved already
    pub fn connected(&self, name: Option<&str>) -> bool {
        self.registry.connected(&self.connection_name(name))
    }

    /// Add or replace a connection's configuration.
    ///
    /// A driver already built for `name` is dropped so the next resolve
    /// picks up the new settings.
    pub fn add_connection(&self, name: &str, config: ConnectionConfig) -> Result<()> {
        self.config.set(
            &format!("{}.{}", CONNECTIONS_KEY, name),
            serde_json::to_value(config)?,
        );
        if self.registry.disconnect(name) {
            tracing::debug!(connection = %name, "Queue connection reconfigured");
        }
        Ok(())
    }

    /// Drop a cached driver
    pub fn disconnect(&self, name: &str) -> bool {
        self.registry.disconnect(name)
    }

    /// Install a connector for a driver type
    pub fn extend<F, Fut>(&self, driver_type: &str, connector: F)
    where
        F: Fn(ConnectorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Driver>>> + Send + 'static,
    {
        self.registry.register(driver_type, connector);
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // --- Dispatch ---

    /// Push a job onto a queue
    pub async fn push<D: Serialize>(
        &self,
        job: &str,
        data: D,
        options: DispatchOptions,
    ) -> Result<String> {
        self.enqueue(job, data, None, options).await
    }

    /// Push a job that becomes available after `delay`
    pub async fn later<D: Serialize>(
        &self,
        delay: impl Into<Delay>,
        job: &str,
        data: D,
        options: DispatchOptions,
    ) -> Result<String> {
        self.enqueue(job, data, Some(delay.into()), options).await
    }

    /// Push several jobs sharing one set of arguments.
    ///
    /// Not atomic: an error may leave earlier jobs enqueued.
    pub async fn bulk<D: Serialize>(
        &self,
        jobs: &[&str],
        data: D,
        options: DispatchOptions,
    ) -> Result<Vec<String>> {
        let driver = self.connection(options.connection.as_deref()).await?;
        let queue = self.queue_name(&*driver, &options);
        let data = serde_json::to_value(data)?;
        let now = self.clock.now();

        let envelopes = jobs
            .iter()
            .map(|job| Envelope::new(queue.clone(), Payload::new(*job, data.clone()), now, now))
            .collect();

        let ids = driver.enqueue_batch(envelopes).await?;
        tracing::debug!(
            connection = %driver.connection_name(),
            queue = %queue,
            count = ids.len(),
            "Jobs pushed"
        );
        Ok(ids)
    }

    /// Push a typed job
    pub async fn dispatch<J: Job>(&self, data: J::Data, options: DispatchOptions) -> Result<String> {
        self.push(J::NAME, data, options).await
    }

    /// Push a typed job that becomes available after `delay`
    pub async fn dispatch_later<J: Job>(
        &self,
        delay: impl Into<Delay>,
        data: J::Data,
        options: DispatchOptions,
    ) -> Result<String> {
        self.later(delay, J::NAME, data, options).await
    }

    /// Pending plus reserved jobs on a queue
    pub async fn size(&self, options: DispatchOptions) -> Result<usize> {
        let driver = self.connection(options.connection.as_deref()).await?;
        let queue = self.queue_name(&*driver, &options);
        driver.size(&queue).await
    }

    fn queue_name(&self, driver: &dyn Driver, options: &DispatchOptions) -> String {
        options
            .queue
            .clone()
            .unwrap_or_else(|| driver.default_queue().to_string())
    }

    async fn enqueue<D: Serialize>(
        &self,
        job: &str,
        data: D,
        delay: Option<Delay>,
        options: DispatchOptions,
    ) -> Result<String> {
        let driver = self.connection(options.connection.as_deref()).await?;
        let queue = self.queue_name(&*driver, &options);
        let payload = Payload::new(job, serde_json::to_value(data)?);

        let now = self.clock.now();
        let available_at = delay.map_or(now, |delay| delay.available_at(now));
        let envelope = Envelope::new(queue, payload, available_at, now);

        tracing::debug!(
            connection = %driver.connection_name(),
            queue = %envelope.queue,
            job_id = %envelope.id,
            job = %job,
            available_at = %envelope.available_at,
            "Job pushed"
        );

        driver.enqueue(envelope).await
    }

    // --- Handlers and events ---

    /// Register a handler under `J::NAME`
    pub async fn register_job<J: Job>(&self, job: J) {
        self.handlers.register_job(job).await;
    }

    pub fn handlers(&self) -> &JobRegistry {
        &self.handlers
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Listen for jobs about to run
    pub fn before<F>(&self, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Processing, listener);
    }

    /// Listen for jobs that completed
    pub fn after<F>(&self, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Processed, listener);
    }

    pub fn exception_occurred<F>(&self, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::ExceptionOccurred, listener);
    }

    pub fn looping<F>(&self, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Looping, listener);
    }

    /// Listen for jobs failed for good
    pub fn failing<F>(&self, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Failed, listener);
    }

    pub fn stopping<F>(&self, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Stopping, listener);
    }

    // --- Workers ---

    pub fn set_down_for_maintenance(&self, down: bool) {
        self.maintenance.store(down, Ordering::Release);
        tracing::info!(down, "Queue maintenance mode changed");
    }

    pub fn is_down_for_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn failed_jobs(&self) -> Option<&Arc<dyn FailedJobProvider>> {
        self.failed.as_ref()
    }

    /// Build a worker for a connection
    pub async fn worker(&self, connection: Option<&str>, options: WorkerOptions) -> Result<Worker> {
        let driver = self.connection(connection).await?;
        let mut worker = Worker::new(driver, self.handlers.clone(), self.events.clone(), options)
            .with_maintenance_flag(self.maintenance.clone());
        if let Some(failed) = &self.failed {
            worker = worker.with_failed_jobs(failed.clone());
        }
        Ok(worker)
    }
}
