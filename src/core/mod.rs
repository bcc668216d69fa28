//! The redq dispatcher and its worker side.
//!
//! [`Redq`] is the entry point of the crate: it owns the broker connection,
//! the serializer, the ordered queue set and the task registry. Producers use
//! it to declare queues and tasks; workers are built from it with
//! [`Redq::worker`].

use crate::config::RedqConfig;
use crate::error::{RedqError, RedqResult};
use crate::queue::{Broker, BrokerFactory, Queue, QueueRegistry, SharedBroker};
use crate::serializer::{JsonSerializer, Serializer};
use crate::task::Task;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod engine;
pub mod inspect;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use engine::WorkerEngine;
pub use inspect::{EtaInfo, QueueInfo, RedqInfo};
pub use registry::{TaskHandler, TaskRegistry, TaskTypeStats};
pub use scheduler::Scheduler;
pub use worker::{BroadcastListener, PollOutcome, Worker, WorkerStats};

/// The task dispatcher.
///
/// `Redq` is cheap to clone; clones share the same broker, queues and
/// registry.
///
/// # Examples
///
/// ```rust
/// use redq::prelude::*;
///
/// async fn resize(payload: Payload) -> RedqResult<()> {
///     let width: u32 = payload.arg(0)?;
///     tracing::info!(width, "resizing");
///     Ok(())
/// }
///
/// #[tokio::main]
/// async fn main() -> RedqResult<()> {
///     let redq = Redq::new(RedqConfig::testing()).await?;
///     redq.queue("high").await;
///     redq.queue("default").await;
///
///     let task = redq.task("resize", resize).await?;
///     task.delay(Invocation::new().arg(640)).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Redq {
    inner: Arc<RedqInner>,
}

struct RedqInner {
    config: RedqConfig,
    broker: SharedBroker,
    serializer: Arc<dyn Serializer>,
    queues: RwLock<QueueRegistry>,
    registry: TaskRegistry,
}

impl std::fmt::Debug for Redq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redq")
            .field("config", &self.inner.config)
            .field("serializer", &self.inner.serializer)
            .finish_non_exhaustive()
    }
}

impl Redq {
    /// Create a dispatcher with the broker selected by `config`.
    pub async fn new(config: RedqConfig) -> RedqResult<Self> {
        Self::check(&config)?;
        let broker = BrokerFactory::from_config(&config.broker).await?;
        Ok(Self::build(config, broker, Arc::new(JsonSerializer)))
    }

    /// Create a dispatcher on top of an existing broker.
    pub fn with_broker<B: Broker + 'static>(config: RedqConfig, broker: B) -> RedqResult<Self> {
        Self::with_shared_broker(config, Arc::new(broker))
    }

    /// Create a dispatcher on a broker shared with other dispatchers.
    ///
    /// Dispatchers sharing one broker behave like separate processes talking
    /// to the same server.
    pub fn with_shared_broker(config: RedqConfig, broker: SharedBroker) -> RedqResult<Self> {
        Self::with_parts(config, broker, Arc::new(JsonSerializer))
    }

    /// Create a dispatcher with a custom serializer.
    pub fn with_parts(
        config: RedqConfig,
        broker: SharedBroker,
        serializer: Arc<dyn Serializer>,
    ) -> RedqResult<Self> {
        Self::check(&config)?;
        Ok(Self::build(config, broker, serializer))
    }

    fn check(config: &RedqConfig) -> RedqResult<()> {
        config
            .validate()
            .map_err(|errors| RedqError::config(errors.join("; ")))
    }

    fn build(config: RedqConfig, broker: SharedBroker, serializer: Arc<dyn Serializer>) -> Self {
        let queues = QueueRegistry::new(config.broker.key_prefix.clone());
        Self {
            inner: Arc::new(RedqInner {
                config,
                broker,
                serializer,
                queues: RwLock::new(queues),
                registry: TaskRegistry::new(),
            }),
        }
    }

    /// Declare a queue, or return the existing one with that name.
    ///
    /// Declaration order is priority order: workers drain earlier queues
    /// first, and the most recently declared queue is the default route.
    pub async fn queue(&self, name: &str) -> Queue {
        self.inner.queues.write().await.create(name)
    }

    /// Declared queues, highest priority first.
    pub async fn queues(&self) -> Vec<Queue> {
        self.inner.queues.read().await.queues().to_vec()
    }

    /// Broker keys of the declared queues, highest priority first.
    pub async fn queue_keys(&self) -> Vec<String> {
        self.inner.queues.read().await.keys()
    }

    pub(crate) async fn resolve_queue(
        &self,
        explicit: Option<&str>,
        bound: Option<&Queue>,
    ) -> RedqResult<Queue> {
        self.inner.queues.write().await.resolve(explicit, bound)
    }

    /// Register `handler` as task `name` and return its producer handle.
    pub async fn task<H>(&self, name: &str, handler: H) -> RedqResult<Task>
    where
        H: TaskHandler + 'static,
    {
        self.inner.registry.register(name, Arc::new(handler)).await?;
        Ok(Task::new(name.to_string(), None, self.clone()))
    }

    /// Register a task bound to `queue`, declaring the queue if needed.
    pub async fn task_on<H>(&self, name: &str, queue: &str, handler: H) -> RedqResult<Task>
    where
        H: TaskHandler + 'static,
    {
        let queue = self.queue(queue).await;
        self.inner.registry.register(name, Arc::new(handler)).await?;
        Ok(Task::new(name.to_string(), Some(queue), self.clone()))
    }

    /// Register a task named after the handler's type path.
    ///
    /// For a plain `async fn` this is its module path, e.g.
    /// `my_app::jobs::send_email`. Producer and worker processes must build
    /// the same binary for the names to line up.
    pub async fn task_fn<H>(&self, handler: H) -> RedqResult<Task>
    where
        H: TaskHandler + 'static,
    {
        self.task(std::any::type_name::<H>(), handler).await
    }

    /// Producer handle for a task registered earlier.
    pub async fn get_task(&self, name: &str) -> RedqResult<Task> {
        if !self.inner.registry.contains(name).await {
            return Err(RedqError::TaskNotFound {
                name: name.to_string(),
            });
        }
        Ok(Task::new(name.to_string(), None, self.clone()))
    }

    /// Build a worker engine using the configured worker settings.
    pub fn worker(&self) -> WorkerEngine {
        WorkerEngine::new(self.clone(), self.inner.config.worker.clone())
    }

    /// Build a scheduler for periodic tasks.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }

    /// Check that the broker is reachable.
    pub async fn health_check(&self) -> RedqResult<()> {
        self.inner.broker.health_check().await
    }

    /// The configuration used by this dispatcher.
    pub fn config(&self) -> &RedqConfig {
        &self.inner.config
    }

    /// The broker shared by producers and workers.
    pub fn broker(&self) -> &SharedBroker {
        &self.inner.broker
    }

    /// The payload serializer.
    pub fn serializer(&self) -> &dyn Serializer {
        self.inner.serializer.as_ref()
    }

    /// Registered task handlers.
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Key of the shared ETA sorted set.
    pub fn eta_key(&self) -> String {
        self.inner.config.broker.eta_key()
    }

    /// Pub/sub channel used for broadcasts.
    pub fn broadcast_channel(&self) -> String {
        self.inner.config.broker.broadcast_channel()
    }
}
