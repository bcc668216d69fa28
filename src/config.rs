//! Configuration types for redq.
//!
//! This module contains all configuration structures used throughout redq,
//! including broker settings, worker tuning, ETA behaviour and logging.

use crate::error::{RedqError, RedqResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for redq.
///
/// # Examples
///
/// ```rust
/// use redq::config::{RedqConfig, WorkerConfig, BrokerConfig};
///
/// // Use default configuration
/// let config = RedqConfig::default();
///
/// // Custom configuration
/// let config = RedqConfig {
///     worker: WorkerConfig {
///         concurrency: 8,
///         ..Default::default()
///     },
///     broker: BrokerConfig::in_memory().with_max_size(10_000),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedqConfig {
    /// Broker backend configuration
    pub broker: BrokerConfig,

    /// Worker process configuration
    pub worker: WorkerConfig,

    /// How `delay` treats tasks carrying an ETA
    pub eta: EtaMode,

    /// Periodic scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent poll loops inside one worker process
    pub concurrency: usize,

    /// How long a single blocking pop waits for work (in milliseconds)
    pub poll_timeout_ms: u64,

    /// Time to wait for poll loops to finish their current task on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Base delay after a broker error before polling again (in milliseconds)
    pub error_backoff_ms: u64,

    /// Whether this worker subscribes to the broadcast channel
    pub listen_broadcasts: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            poll_timeout_ms: 1000,
            shutdown_timeout_secs: 30,
            error_backoff_ms: 500,
            listen_broadcasts: true,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the blocking pop timeout.
    pub fn with_poll_timeout(mut self, timeout_ms: u64) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Enable or disable the broadcast listener.
    pub fn with_broadcasts(mut self, enabled: bool) -> Self {
        self.listen_broadcasts = enabled;
        self
    }

    /// Blocking pop timeout as a `Duration`.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout_ms.millis()
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Backend used to store queues
    pub backend: BrokerBackendConfig,

    /// Prefix for every broker key and channel
    pub key_prefix: String,

    /// Maximum number of payloads per queue (0 = unlimited)
    pub max_queue_size: usize,

    /// What a push does when a queue is at `max_queue_size`
    pub overflow: OverflowPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackendConfig::InMemory,
            key_prefix: "redq".to_string(),
            max_queue_size: 0,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl BrokerConfig {
    /// Create configuration for the in-memory broker.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Create configuration for a Redis broker.
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub fn redis(connection_string: String) -> Self {
        Self {
            backend: BrokerBackendConfig::Redis(RedisConfig {
                connection_string,
                pool_size: 10,
                db: 0,
            }),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Broker key of the queue called `name`.
    pub fn queue_key(&self, name: &str) -> String {
        crate::queue::Queue::new(name, &self.key_prefix)
            .broker_key()
            .to_string()
    }

    /// Broker key of the sorted set holding every ETA entry.
    pub fn eta_key(&self) -> String {
        format!("{}:eta", self.key_prefix)
    }

    /// Channel used for broadcasts.
    pub fn broadcast_channel(&self) -> String {
        format!("{}:broadcast", self.key_prefix)
    }
}

/// Broker backend-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum BrokerBackendConfig {
    /// In-process broker (default)
    #[default]
    InMemory,

    /// Redis broker configuration
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    Redis(RedisConfig),
}

/// Redis broker configuration.
#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Maximum idle connections kept for blocking pops
    pub pool_size: u32,

    /// Redis database number
    pub db: i64,
}

/// Behaviour of a push against a queue that reached its capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Fail the push with `QueueFull` and leave the queue untouched
    #[default]
    Reject,
    /// Wait until a consumer makes room (in-memory broker only)
    Block,
}

/// How `delay` handles a task that carries an ETA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EtaMode {
    /// Record the ETA entry scored by the call time and also push the
    /// payload onto its queue right away. The task may therefore run
    /// before its ETA and again once the entry is promoted.
    #[default]
    Eager,
    /// Record the ETA entry scored by the ETA itself and push nothing; the
    /// task becomes visible only when a worker promotes it.
    Deferred,
}

/// Periodic scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between two schedule evaluations (in milliseconds)
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_ms: 1000 }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, overridden by `RUST_LOG` when set
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber built from this configuration.
    pub fn init(&self) -> RedqResult<()> {
        use tracing_subscriber::EnvFilter;

        let default_level: tracing::Level = self.level.into();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.include_targets);

        let result = match (self.json_format, self.include_timestamps) {
            (true, true) => builder.json().try_init(),
            (true, false) => builder.json().without_time().try_init(),
            (false, true) => builder.try_init(),
            (false, false) => builder.without_time().try_init(),
        };

        result.map_err(|e| RedqError::config(format!("Failed to install logger: {}", e)))
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

impl RedqConfig {
    /// Create a new configuration suited to local development.
    pub fn development() -> Self {
        Self {
            worker: WorkerConfig {
                concurrency: 2,
                poll_timeout_ms: 500,
                ..Default::default()
            },
            broker: BrokerConfig {
                max_queue_size: 1000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration suited to production.
    pub fn production() -> Self {
        Self {
            worker: WorkerConfig {
                concurrency: num_cpus::get() * 2,
                poll_timeout_ms: 2000,
                shutdown_timeout_secs: 60,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            worker: WorkerConfig {
                concurrency: 1,
                poll_timeout_ms: 20,
                shutdown_timeout_secs: 5,
                error_backoff_ms: 10,
                listen_broadcasts: true,
            },
            broker: BrokerConfig {
                max_queue_size: 100,
                ..Default::default()
            },
            scheduler: SchedulerConfig { tick_ms: 10 },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse a configuration from a JSON document; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> RedqResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config
            .validate()
            .map_err(|errors| RedqError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker.concurrency == 0 {
            errors.push("Worker concurrency must be greater than 0".to_string());
        }

        if self.worker.concurrency > 1000 {
            errors.push("Worker concurrency should not exceed 1000".to_string());
        }

        if self.worker.poll_timeout_ms == 0 {
            errors.push("Poll timeout must be greater than 0".to_string());
        }

        if self.broker.key_prefix.is_empty() {
            errors.push("Broker key prefix must not be empty".to_string());
        }

        if self.broker.overflow == OverflowPolicy::Block && self.broker.max_queue_size == 0 {
            errors.push("Block overflow policy requires a max queue size".to_string());
        }

        #[cfg(feature = "redis-queue")]
        if let BrokerBackendConfig::Redis(redis) = &self.broker.backend {
            if self.broker.overflow == OverflowPolicy::Block {
                errors.push("Redis broker only supports the Reject overflow policy".to_string());
            }
            if redis.pool_size == 0 {
                errors.push("Redis pool size must be greater than 0".to_string());
            }
        }

        if self.scheduler.tick_ms == 0 {
            errors.push("Scheduler tick must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
