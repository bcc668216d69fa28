//! Error types for redq operations.

use thiserror::Error;

/// Result type used throughout redq.
pub type RedqResult<T> = Result<T, RedqError>;

/// Main error type for redq operations.
#[derive(Error, Debug)]
pub enum RedqError {
    /// Pushing a task payload to the broker failed
    #[error("Failed to enqueue task '{task}': {message}")]
    Enqueue {
        /// Name of the task being enqueued
        task: String,
        /// Error message
        message: String,
        /// Underlying broker error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bounded queue has no room left
    #[error("Queue '{key}' is full (capacity: {capacity})")]
    QueueFull {
        /// Broker key of the full queue
        key: String,
        /// Configured capacity
        capacity: usize,
    },

    /// Task execution failed
    #[error("Task execution failed: {message}")]
    TaskExecutionFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Task not found in registry
    #[error("Task '{name}' not found in registry")]
    TaskNotFound {
        /// The task name that wasn't found
        name: String,
    },

    /// A task with the same name is already registered
    #[error("Task '{name}' is already registered")]
    DuplicateTask {
        /// The duplicated task name
        name: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Broker backend error
    #[error("Broker error: {message}")]
    BrokerError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Worker engine is already running
    #[error("Worker engine is already running")]
    AlreadyRunning,

    /// Worker engine is not running
    #[error("Worker engine is not running")]
    NotRunning,

    /// Redis connection error
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedqError {
    /// Create a new task execution error
    pub fn task_execution<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TaskExecutionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a task execution error without an underlying cause
    pub fn execution(message: impl Into<String>) -> Self {
        Self::TaskExecutionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new broker error
    pub fn broker<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BrokerError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Wrap a failed push into an enqueue error carrying the task name
    pub fn enqueue(task: impl Into<String>, source: RedqError) -> Self {
        Self::Enqueue {
            task: task.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error reports a queue at capacity, directly or wrapped
    pub fn is_queue_full(&self) -> bool {
        match self {
            Self::QueueFull { .. } => true,
            Self::Enqueue {
                source: Some(source),
                ..
            } => source
                .downcast_ref::<RedqError>()
                .is_some_and(RedqError::is_queue_full),
            _ => false,
        }
    }
}
