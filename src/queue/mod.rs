//! Queues and broker backends for redq.
//!
//! A [`Queue`] is a named channel mapped to one broker key. Queues live in a
//! dispatcher-owned [`QueueRegistry`] whose order is the polling priority:
//! the first registered queue is drained first and the last registered one
//! is the default destination.
//!
//! The [`Broker`] trait is the whole contract redq needs from the shared
//! store. Two backends ship with the crate:
//! - **In-Memory**: bounded, single-process, ideal for tests and development
//! - **Redis**: distributed, for multi-process and multi-server setups
//!
//! # Examples
//!
//! ```rust,no_run
//! use redq::config::BrokerConfig;
//! use redq::queue::{BrokerFactory, InMemoryBroker};
//!
//! # async fn example() -> redq::RedqResult<()> {
//! // In-memory broker (default)
//! let broker = InMemoryBroker::new();
//!
//! // Any backend from configuration
//! let broker = BrokerFactory::from_config(&BrokerConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{BrokerBackendConfig, BrokerConfig};
use crate::error::{RedqError, RedqResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryBroker;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisBroker;

/// A named queue and the broker key backing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Queue {
    name: String,
    broker_key: String,
}

impl Queue {
    /// Create a queue under `prefix`.
    pub fn new(name: impl Into<String>, prefix: &str) -> Self {
        let name = name.into();
        let broker_key = format!("{}:queue:{}", prefix, name);
        Self { name, broker_key }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the list holding this queue's payloads.
    pub fn broker_key(&self) -> &str {
        &self.broker_key
    }
}

/// Ordered set of queues, highest priority first.
///
/// Queues are only ever appended; once a name is registered its position,
/// and therefore its priority, never changes.
#[derive(Debug, Clone)]
pub struct QueueRegistry {
    prefix: String,
    queues: Vec<Queue>,
    by_name: HashMap<String, usize>,
}

impl QueueRegistry {
    /// An empty registry creating keys under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            queues: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Return the queue called `name`, registering it at the lowest priority
    /// if it does not exist yet.
    pub fn create(&mut self, name: &str) -> Queue {
        if let Some(&index) = self.by_name.get(name) {
            return self.queues[index].clone();
        }

        let queue = Queue::new(name, &self.prefix);
        self.by_name.insert(name.to_string(), self.queues.len());
        self.queues.push(queue.clone());

        tracing::debug!(queue = %name, priority = self.queues.len() - 1, "Registered queue");
        queue
    }

    /// Look up a queue without registering it.
    pub fn get(&self, name: &str) -> Option<&Queue> {
        self.by_name.get(name).map(|&index| &self.queues[index])
    }

    /// The lowest-priority queue, used when nothing else applies.
    pub fn default_queue(&self) -> Option<&Queue> {
        self.queues.last()
    }

    /// Resolve the destination of a call: `explicit`, then `bound`, then
    /// the default queue.
    pub fn resolve(&mut self, explicit: Option<&str>, bound: Option<&Queue>) -> RedqResult<Queue> {
        if let Some(name) = explicit {
            return Ok(self.create(name));
        }
        if let Some(queue) = bound {
            return Ok(queue.clone());
        }
        self.default_queue().cloned().ok_or_else(|| {
            RedqError::config("No queue supplied and no queues registered on the dispatcher")
        })
    }

    /// Queues in priority order.
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Broker keys in priority order.
    pub fn keys(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.broker_key.clone()).collect()
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether no queue is registered.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Capability contract of the shared store.
///
/// Every method must be atomic at the broker level; redq performs no
/// locking of its own around them.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a payload to the tail of the list at `key`.
    ///
    /// Fails with `QueueFull` when the list is at capacity, leaving it
    /// unchanged.
    async fn push(&self, key: &str, payload: Vec<u8>) -> RedqResult<()>;

    /// Pop the head of the first non-empty list among `keys`, checked in
    /// order, waiting up to `timeout` for one to receive a payload.
    async fn pop(&self, keys: &[String], timeout: Duration)
    -> RedqResult<Option<(String, Vec<u8>)>>;

    /// Add `payload` to the sorted set at `key` unless it is already a member.
    ///
    /// Returns whether the payload was inserted.
    async fn add_delayed(&self, key: &str, payload: Vec<u8>, score: f64) -> RedqResult<bool>;

    /// Atomically remove and return every member scored at or below
    /// `max_score`, lowest score first.
    async fn pop_due(&self, key: &str, max_score: f64) -> RedqResult<Vec<Vec<u8>>>;

    /// Publish a message, returning how many subscribers received it.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> RedqResult<usize>;

    /// Subscribe to a channel. Dropping the stream unsubscribes.
    async fn subscribe(&self, channel: &str) -> RedqResult<BoxStream<'static, Vec<u8>>>;

    /// Number of payloads in the list at `key`.
    async fn len(&self, key: &str) -> RedqResult<usize>;

    /// Number of members in the sorted set at `key`.
    async fn delayed_len(&self, key: &str) -> RedqResult<usize>;

    /// Health check for the broker backend
    async fn health_check(&self) -> RedqResult<()>;
}

/// Convenient type alias for a shared broker
pub type SharedBroker = Arc<dyn Broker>;

/// Factory methods for creating brokers
pub struct BrokerFactory;

impl BrokerFactory {
    /// Create an in-memory broker
    pub fn in_memory(config: &BrokerConfig) -> SharedBroker {
        Arc::new(InMemoryBroker::with_config(config))
    }

    /// Create a Redis broker
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub async fn redis(config: &BrokerConfig) -> RedqResult<SharedBroker> {
        let broker = RedisBroker::new(config).await?;
        Ok(Arc::new(broker))
    }

    /// Create whichever broker `config` selects
    pub async fn from_config(config: &BrokerConfig) -> RedqResult<SharedBroker> {
        match &config.backend {
            BrokerBackendConfig::InMemory => Ok(Self::in_memory(config)),
            #[cfg(feature = "redis-queue")]
            BrokerBackendConfig::Redis(_) => Self::redis(config).await,
        }
    }
}
