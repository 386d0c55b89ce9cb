use thiserror::Error;

/// Errors raised by the broker, the connection registry and the drivers.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No connector for [{0}]")]
    UnknownDriver(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job failed: {0}")]
    JobFailed(#[from] JobError),
}

/// Outcome of a failed handler invocation.
///
/// A recoverable failure is released back onto the queue until the
/// worker's attempt limit is reached; a fatal failure is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("{0}")]
    Recoverable(String),

    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
