//! # redq
//!
//! A distributed task queue for async Rust applications.
//!
//! ## Features
//!
//! - **Named Queues**: Declaration order is polling priority; the last declared queue is the default route
//! - **Delayed Tasks**: ETAs recorded in a shared sorted set and promoted atomically by workers
//! - **Broadcasts**: Run a task once on every listening worker process via pub/sub
//! - **Periodic Tasks**: A scheduler that enqueues tasks at fixed intervals
//! - **Graceful Shutdown**: Workers finish their current task before stopping
//! - **Pluggable Brokers**: In-memory for tests and development, Redis for production
//!
//! ## Quick Start
//!
//! ```rust
//! use redq::prelude::*;
//!
//! async fn send_email(payload: Payload) -> RedqResult<()> {
//!     let to: String = payload.arg(0)?;
//!     tracing::info!(%to, "sending email");
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> RedqResult<()> {
//!     let redq = Redq::new(RedqConfig::testing()).await?;
//!     redq.queue("high").await;
//!     redq.queue("default").await;
//!
//!     let email = redq.task("send_email", send_email).await?;
//!     email.delay(Invocation::new().arg("ops@example.com")).await?;
//!
//!     let engine = redq.worker();
//!     engine.start().await?;
//!     // ...
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod core;
pub mod error;
pub mod queue;
pub mod serializer;
pub mod task;
pub mod utils;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;

pub mod prelude {
    pub use crate::config::{
        BrokerConfig, EtaMode, LoggingConfig, OverflowPolicy, RedqConfig, WorkerConfig,
    };
    pub use crate::core::{Redq, RedqInfo, Scheduler, TaskHandler, WorkerEngine, WorkerStats};
    pub use crate::error::{RedqError, RedqResult};
    pub use crate::queue::{Broker, InMemoryBroker, Queue};
    pub use crate::task::{Invocation, Payload, Task};
    pub use async_trait::async_trait;

    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub use crate::queue::RedisBroker;
}

pub use crate::config::RedqConfig;
pub use crate::core::{Redq, Scheduler, TaskHandler, WorkerEngine};
pub use crate::error::{RedqError, RedqResult};
pub use crate::task::{Invocation, Payload, Task};
