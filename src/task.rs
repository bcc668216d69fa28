//! Task handles, invocations and the payload that travels through the broker.

use crate::config::EtaMode;
use crate::core::Redq;
use crate::error::{RedqError, RedqResult};
use crate::queue::Queue;
use crate::utils::{now_timestamp, unix_timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime};

/// Serialized record describing one task invocation.
///
/// This is exactly what gets stored in the broker: the task name used to
/// find the handler on the worker side, the queue the payload was routed to,
/// and the call arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Registered task name
    pub name: String,
    /// Name of the queue the payload was routed to
    pub queue: String,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
}

impl Payload {
    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> RedqResult<T> {
        let value = self.args.get(index).cloned().ok_or_else(|| {
            RedqError::execution(format!(
                "task '{}' expected a positional argument at index {}",
                self.name, index
            ))
        })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Deserialize the keyword argument `key`.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> RedqResult<T> {
        self.kwarg_opt(key)?.ok_or_else(|| {
            RedqError::execution(format!(
                "task '{}' expected a keyword argument '{}'",
                self.name, key
            ))
        })
    }

    /// Deserialize the keyword argument `key` if it was supplied.
    pub fn kwarg_opt<T: DeserializeOwned>(&self, key: &str) -> RedqResult<Option<T>> {
        match self.kwargs.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// Arguments and routing options for a single `delay` or `broadcast` call.
///
/// ```rust
/// use redq::task::Invocation;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let call = Invocation::new()
///     .arg(42)
///     .arg(json!({"nested": [1, 2, 3]}))
///     .kwarg("to", "ops@example.com")
///     .queue("high")
///     .countdown(Duration::from_secs(30));
/// assert_eq!(call.args.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
    /// Explicit queue, overriding the task's bound queue
    pub queue: Option<String>,
    /// Point in time at which the task becomes due
    pub eta: Option<SystemTime>,
}

impl Invocation {
    /// An invocation without arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append any serializable value as a positional argument.
    pub fn try_arg<T: Serialize>(mut self, value: &T) -> RedqResult<Self> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Set any serializable value as a keyword argument.
    pub fn try_kwarg<T: Serialize>(mut self, key: impl Into<String>, value: &T) -> RedqResult<Self> {
        self.kwargs.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Route to an explicit queue.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    /// Schedule for a point in time.
    pub fn eta(mut self, at: SystemTime) -> Self {
        self.eta = Some(at);
        self
    }

    /// Schedule `delay` from now.
    pub fn countdown(self, delay: Duration) -> Self {
        self.eta(SystemTime::now() + delay)
    }
}

/// Producer-side handle for a registered task.
///
/// A `Task` is what [`Redq::task`] hands back after wrapping a handler. It
/// only knows the task name, its optional bound queue and the owning
/// dispatcher; the handler itself stays in the dispatcher's registry.
#[derive(Clone)]
pub struct Task {
    name: String,
    queue: Option<Queue>,
    redq: Redq,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(name: String, queue: Option<Queue>, redq: Redq) -> Self {
        Self { name, queue, redq }
    }

    /// Registered task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue bound at registration time, if any.
    pub fn bound_queue(&self) -> Option<&Queue> {
        self.queue.as_ref()
    }

    /// Build the payload for `invocation` after resolving its queue.
    async fn build_payload(&self, invocation: &Invocation) -> RedqResult<(Queue, Vec<u8>)> {
        let queue = self
            .redq
            .resolve_queue(invocation.queue.as_deref(), self.queue.as_ref())
            .await?;

        let payload = Payload {
            name: self.name.clone(),
            queue: queue.name().to_string(),
            args: invocation.args.clone(),
            kwargs: invocation.kwargs.clone(),
        };
        let bytes = self.redq.serializer().encode(&payload)?;
        Ok((queue, bytes))
    }

    /// Enqueue the task for a worker to run.
    ///
    /// The queue is chosen by precedence: the invocation's explicit queue,
    /// then the task's bound queue, then the dispatcher's last registered
    /// queue. With an ETA the payload is also recorded in the delayed set;
    /// see [`EtaMode`] for how the two interact.
    pub async fn delay(&self, invocation: Invocation) -> RedqResult<()> {
        let (queue, bytes) = self.build_payload(&invocation).await?;
        let broker = self.redq.broker();
        let mode = self.redq.config().eta;

        // Eager mode pushes first so a rejected push leaves no ETA entry.
        if invocation.eta.is_none() || mode == EtaMode::Eager {
            broker
                .push(queue.broker_key(), bytes.clone())
                .await
                .map_err(|e| RedqError::enqueue(&self.name, e))?;

            tracing::debug!(task = %self.name, queue = %queue.name(), "Task enqueued");
        }

        if let Some(eta) = invocation.eta {
            let score = match mode {
                EtaMode::Eager => now_timestamp(),
                EtaMode::Deferred => unix_timestamp(eta),
            };

            let inserted = broker
                .add_delayed(&self.redq.eta_key(), bytes, score)
                .await
                .map_err(|e| RedqError::enqueue(&self.name, e))?;

            if inserted {
                tracing::debug!(task = %self.name, queue = %queue.name(), score, "Task scheduled");
            } else {
                tracing::debug!(task = %self.name, "ETA entry already scheduled");
            }
        }

        Ok(())
    }

    /// Run the task once on every worker process currently listening.
    ///
    /// Returns the number of subscribers the broker delivered the message
    /// to. Workers that are not subscribed at publish time never see it.
    /// An ETA on the invocation is ignored.
    pub async fn broadcast(&self, invocation: Invocation) -> RedqResult<usize> {
        let (queue, bytes) = self.build_payload(&invocation).await?;

        let receivers = self
            .redq
            .broker()
            .publish(&self.redq.broadcast_channel(), bytes)
            .await
            .map_err(|e| RedqError::enqueue(&self.name, e))?;

        tracing::debug!(
            task = %self.name,
            queue = %queue.name(),
            receivers,
            "Task broadcast"
        );
        Ok(receivers)
    }
}
