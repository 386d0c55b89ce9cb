//! Queue configuration.
//!
//! Connections live in a key-value [`ConfigSource`] under
//! `queue.connections.<name>`, with the default connection name under
//! `queue.default`. [`ConfigRepository`] is the in-process implementation;
//! [`QueueConfig`] is the typed form used to seed it from a file or from
//! the environment.
//!
//! # Example
//!
//! ```
//! use conveyor::{ConfigRepository, ConnectionConfig, QueueManager};
//!
//! # fn main() -> conveyor::Result<()> {
//! let manager = QueueManager::new(ConfigRepository::new());
//! manager.add_connection(
//!     "redis",
//!     ConnectionConfig::new("redis")
//!         .option("url", "redis://127.0.0.1/")
//!         .retry_after(120),
//! )?;
//! manager.set_default_connection("redis");
//! assert_eq!(manager.default_connection(), "redis");
//! # Ok(())
//! # }
//! ```

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const DEFAULT_KEY: &str = "queue.default";
pub const CONNECTIONS_KEY: &str = "queue.connections";

/// One named connection: which driver to build and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Driver type used to pick a connector (`sync`, `memory`, `database`, ...)
    pub driver: String,

    /// Queue used when a dispatch does not name one
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Lease length in seconds; also the default retry backoff
    #[serde(default = "default_retry_after")]
    pub retry_after: u64,

    /// Backend specific keys (`url`, `table`, `prefix`, `max_connections`)
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl ConnectionConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            queue: default_queue(),
            retry_after: default_retry_after(),
            options: Map::new(),
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn retry_after(mut self, secs: u64) -> Self {
        self.retry_after = secs;
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn retry_after_duration(&self) -> Duration {
        Duration::from_secs(self.retry_after)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    /// A string option that the driver cannot work without
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.option_str(key).ok_or_else(|| {
            QueueError::Configuration(format!(
                "driver [{}] requires the [{}] option",
                self.driver, key
            ))
        })
    }
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_retry_after() -> u64 {
    90
}

fn default_connection() -> String {
    "default".to_string()
}

/// Key-value configuration store read by the connection registry
pub trait ConfigSource: Send + Sync {
    /// Look up a dot-separated key
    fn get(&self, key: &str) -> Option<Value>;

    /// Store a value under a dot-separated key, creating parents
    fn set(&self, key: &str, value: Value);
}

/// In-memory JSON tree addressed by dot paths
#[derive(Debug, Clone, Default)]
pub struct ConfigRepository {
    root: Arc<RwLock<Value>>,
}

impl ConfigRepository {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RwLock::new(Value::Object(Map::new()))),
        }
    }

    pub fn from_value(root: Value) -> Self {
        Self {
            root: Arc::new(RwLock::new(root)),
        }
    }
}

impl ConfigSource for ConfigRepository {
    fn get(&self, key: &str) -> Option<Value> {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        key.split('.')
            .try_fold(&*root, |node, segment| node.get(segment))
            .cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
        let mut segments = key.split('.').peekable();
        let mut node = &mut *root;

        while let Some(segment) = segments.next() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                unreachable!("node was just made an object")
            };

            if segments.peek().is_none() {
                map.insert(segment.to_string(), value);
                return;
            }
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
}

/// Typed queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_connection")]
    pub default: String,

    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default: default_connection(),
            connections: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Parse from a JSON document shaped like `{"default": .., "connections": {..}}`
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| QueueError::Configuration(format!("invalid queue config: {}", e)))
    }

    /// Write every entry into a config source
    pub fn apply(&self, source: &dyn ConfigSource) -> Result<()> {
        source.set(DEFAULT_KEY, Value::String(self.default.clone()));
        for (name, connection) in &self.connections {
            source.set(
                &format!("{}.{}", CONNECTIONS_KEY, name),
                serde_json::to_value(connection)?,
            );
        }
        Ok(())
    }

    pub fn into_repository(self) -> Result<ConfigRepository> {
        let repository = ConfigRepository::new();
        self.apply(&repository)?;
        Ok(repository)
    }
}

#[cfg(feature = "env")]
mod env {
    use super::*;

    /// A single connection described by `QUEUE_*` variables
    #[derive(Debug, Deserialize)]
    struct EnvConnection {
        #[serde(default = "default_connection")]
        connection: String,
        #[serde(default = "default_driver")]
        driver: String,
        #[serde(default = "default_queue")]
        name: String,
        #[serde(default = "default_retry_after")]
        retry_after: u64,
        url: Option<String>,
        table: Option<String>,
        prefix: Option<String>,
        max_connections: Option<u32>,
    }

    fn default_driver() -> String {
        "sync".to_string()
    }

    impl QueueConfig {
        /// Load a single-connection configuration from `QUEUE_*`
        /// environment variables, reading `.env` first when present.
        ///
        /// - `QUEUE_CONNECTION`: connection name, also made the default
        /// - `QUEUE_DRIVER`: driver type (default `sync`)
        /// - `QUEUE_NAME`: default queue (default `default`)
        /// - `QUEUE_RETRY_AFTER`: lease seconds (default 90)
        /// - `QUEUE_URL`, `QUEUE_TABLE`, `QUEUE_PREFIX`, `QUEUE_MAX_CONNECTIONS`
        pub fn from_env() -> Result<Self> {
            dotenvy::dotenv().ok();
            Self::from_env_vars(std::env::vars())
        }

        /// Same as [`QueueConfig::from_env`] over an explicit variable list
        pub fn from_env_vars<I>(vars: I) -> Result<Self>
        where
            I: IntoIterator<Item = (String, String)>,
        {
            let env: EnvConnection = envy::prefixed("QUEUE_")
                .from_iter(vars)
                .map_err(|e| QueueError::Configuration(e.to_string()))?;

            let mut connection = ConnectionConfig::new(env.driver)
                .queue(env.name)
                .retry_after(env.retry_after);
            if let Some(url) = env.url {
                connection = connection.option("url", url);
            }
            if let Some(table) = env.table {
                connection = connection.option("table", table);
            }
            if let Some(prefix) = env.prefix {
                connection = connection.option("prefix", prefix);
            }
            if let Some(max) = env.max_connections {
                connection = connection.option("max_connections", max);
            }

            let mut connections = HashMap::new();
            connections.insert(env.connection.clone(), connection);

            Ok(Self {
                default: env.connection,
                connections,
            })
        }
    }
}
