//! Connection registry
//!
//! Maps connection names to configuration and lazily builds one driver per
//! name through connectors registered by driver type. Built drivers are
//! cached for the life of the registry.

use crate::clock::Clock;
use crate::config::{ConfigSource, ConnectionConfig, CONNECTIONS_KEY};
use crate::driver::Driver;
use crate::error::{QueueError, Result};
use crate::events::Events;
use crate::job::JobRegistry;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;

/// Everything a connector gets to build a driver
#[derive(Clone)]
pub struct ConnectorContext {
    /// Connection name being resolved
    pub name: String,
    pub config: ConnectionConfig,
    pub handlers: JobRegistry,
    pub events: Events,
    pub clock: Arc<dyn Clock>,
}

type Connector =
    Arc<dyn Fn(ConnectorContext) -> BoxFuture<'static, Result<Arc<dyn Driver>>> + Send + Sync>;

type Slot = Arc<OnceCell<Arc<dyn Driver>>>;

#[derive(Clone)]
pub struct ConnectionRegistry {
    config: Arc<dyn ConfigSource>,
    connectors: Arc<RwLock<HashMap<String, Connector>>>,
    connections: Arc<Mutex<HashMap<String, Slot>>>,
    handlers: JobRegistry,
    events: Events,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        handlers: JobRegistry,
        events: Events,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            connectors: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
            handlers,
            events,
            clock,
        }
    }

    /// Install or replace the connector for a driver type.
    ///
    /// Drivers already built keep running; only later resolutions use the
    /// new connector.
    pub fn register<F, Fut>(&self, driver_type: &str, connector: F)
    where
        F: Fn(ConnectorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Driver>>> + Send + 'static,
    {
        let connector: Connector = Arc::new(move |ctx| Box::pin(connector(ctx)));
        let mut connectors = self.connectors.write().unwrap_or_else(|e| e.into_inner());
        connectors.insert(driver_type.to_string(), connector);
    }

    pub fn has_connector(&self, driver_type: &str) -> bool {
        let connectors = self.connectors.read().unwrap_or_else(|e| e.into_inner());
        connectors.contains_key(driver_type)
    }

    /// Get the driver for `name`, building it on first use.
    ///
    /// Concurrent first resolutions of one name share a single connector
    /// call. A failed build is not cached, so a later call tries again.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Driver>> {
        let slot = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.entry(name.to_string()).or_default().clone()
        };

        match slot.get_or_try_init(|| self.connect(name)).await {
            Ok(driver) => Ok(driver.clone()),
            Err(err) => {
                self.forget_failed(name, &slot);
                Err(err)
            }
        }
    }

    /// Drop an unbuilt slot nobody else is waiting on, so unresolvable
    /// names do not accumulate
    fn forget_failed(&self, name: &str, slot: &Slot) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let idle = connections.get(name).map_or(false, |current| {
            Arc::ptr_eq(current, slot) && !current.initialized() && Arc::strong_count(current) == 2
        });
        if idle {
            connections.remove(name);
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether `name` has already been built. Never triggers a build.
    pub fn connected(&self, name: &str) -> bool {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections
            .get(name)
            .map_or(false, |slot| slot.initialized())
    }

    /// Names of every connection built so far
    pub fn connection_names(&self) -> Vec<String> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop the cached driver so the next resolve rebuilds it from the
    /// current configuration
    pub fn disconnect(&self, name: &str) -> bool {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.remove(name).map_or(false, |slot| slot.initialized())
    }

    /// Configuration for a connection name.
    ///
    /// The name `null` needs no entry and maps to the `null` driver.
    pub fn connection_config(&self, name: &str) -> Result<ConnectionConfig> {
        match self.config.get(&format!("{}.{}", CONNECTIONS_KEY, name)) {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                QueueError::Configuration(format!("queue connection [{}] is invalid: {}", name, e))
            }),
            None if name == "null" => Ok(ConnectionConfig::new("null")),
            None => Err(QueueError::Configuration(format!(
                "queue connection [{}] is not configured",
                name
            ))),
        }
    }

    async fn connect(&self, name: &str) -> Result<Arc<dyn Driver>> {
        let config = self.connection_config(name)?;

        let connector = {
            let connectors = self.connectors.read().unwrap_or_else(|e| e.into_inner());
            connectors.get(&config.driver).cloned()
        }
        .ok_or_else(|| QueueError::UnknownDriver(config.driver.clone()))?;

        tracing::debug!(connection = %name, driver = %config.driver, "Resolving queue connection");

        let driver = connector(ConnectorContext {
            name: name.to_string(),
            config,
            handlers: self.handlers.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
        })
        .await?;

        tracing::info!(
            connection = %name,
            driver = driver.driver_type(),
            "Queue connection established"
        );
        Ok(driver)
    }
}
