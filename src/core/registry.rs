//! Task registry for redq.
//!
//! The registry maps task names to the handlers that run them on the worker
//! side and keeps per-task execution statistics.
//!
//! Any `async fn(Payload) -> RedqResult<()>` (or closure returning such a
//! future) is a [`TaskHandler`]; types that need state can implement the
//! trait directly.
//!
//! ```rust
//! use redq::prelude::*;
//!
//! async fn send_email(payload: Payload) -> RedqResult<()> {
//!     let to: String = payload.kwarg("to")?;
//!     tracing::info!(%to, "sending email");
//!     Ok(())
//! }
//!
//! # async fn example() -> RedqResult<()> {
//! let redq = Redq::new(RedqConfig::development()).await?;
//! redq.queue("default").await;
//! let task = redq.task("send_email", send_email).await?;
//! task.delay(Invocation::new().kwarg("to", "ops@example.com")).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{RedqError, RedqResult};
use crate::task::Payload;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;

/// Code run by a worker for each payload of a task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task for one payload.
    async fn call(&self, payload: Payload) -> RedqResult<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = RedqResult<()>> + Send + 'static,
{
    async fn call(&self, payload: Payload) -> RedqResult<()> {
        (self)(payload).await
    }
}

/// Statistics for a registered task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskTypeStats {
    /// Total number of executions
    pub total_executed: u64,
    /// Number of successful executions
    pub successful: u64,
    /// Number of failed executions, panics included
    pub failed: u64,
    /// Exponential moving average of the execution time
    pub avg_duration: Option<Duration>,
    /// Last execution time
    pub last_executed: Option<SystemTime>,
}

/// Registered handlers and their statistics.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    stats: RwLock<HashMap<String, TaskTypeStats>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").finish_non_exhaustive()
    }
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// Names are unique within a registry; registering the same name twice
    /// fails with `DuplicateTask` and keeps the first handler.
    pub async fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) -> RedqResult<()> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(name) {
            return Err(RedqError::DuplicateTask {
                name: name.to_string(),
            });
        }

        tracing::info!(task = %name, "Registering task");
        handlers.insert(name.to_string(), handler);
        drop(handlers);

        self.stats
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    /// Handler registered under `name`.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    /// Whether a handler is registered under `name`.
    pub async fn contains(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// Run the handler named in `payload`.
    ///
    /// A panic is caught and reported as a `TaskExecutionFailed` error
    /// instead of unwinding into the caller. The handler runs inside the
    /// caller's future, so dropping or aborting the caller cancels it.
    pub async fn execute(&self, payload: Payload) -> RedqResult<()> {
        let name = payload.name.clone();
        let handler = self.get(&name).await.ok_or_else(|| RedqError::TaskNotFound {
            name: name.clone(),
        })?;

        let start = Instant::now();
        let result = match AssertUnwindSafe(handler.call(payload)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(RedqError::execution(format!("task '{}' panicked", name))),
        };

        let duration = start.elapsed();
        self.update_stats(&name, result.is_ok(), duration).await;

        match &result {
            Ok(()) => tracing::debug!(task = %name, ?duration, "Task completed"),
            Err(e) => tracing::error!(task = %name, ?duration, error = %e, "Task failed"),
        }

        result
    }

    /// Registered task names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tasks.
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Whether no task is registered.
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Statistics for one task.
    pub async fn stats(&self, name: &str) -> Option<TaskTypeStats> {
        self.stats.read().await.get(name).cloned()
    }

    /// Statistics for every registered task.
    pub async fn all_stats(&self) -> HashMap<String, TaskTypeStats> {
        self.stats.read().await.clone()
    }

    async fn update_stats(&self, name: &str, success: bool, duration: Duration) {
        let mut stats = self.stats.write().await;
        let task_stats = stats.entry(name.to_string()).or_default();

        task_stats.total_executed += 1;
        task_stats.last_executed = Some(SystemTime::now());
        if success {
            task_stats.successful += 1;
        } else {
            task_stats.failed += 1;
        }

        task_stats.avg_duration = Some(match task_stats.avg_duration {
            Some(avg) => {
                let alpha = 0.1;
                let nanos =
                    alpha * duration.as_nanos() as f64 + (1.0 - alpha) * avg.as_nanos() as f64;
                Duration::from_nanos(nanos as u64)
            }
            None => duration,
        });
    }
}
