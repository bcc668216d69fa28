//! The redq worker engine.
//!
//! The engine owns a worker process's moving parts:
//! - `concurrency` polling loops draining the declared queues
//! - one broadcast listener, when enabled
//! - a shutdown signal shared by all of them

use super::Redq;
use super::worker::{BroadcastListener, Worker, WorkerStats};
use crate::config::WorkerConfig;
use crate::error::{RedqError, RedqResult};
use crate::utils::shutdown_signal;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Runs tasks for a dispatcher until shut down.
///
/// # Examples
///
/// ```rust,no_run
/// use redq::prelude::*;
///
/// # async fn example(redq: Redq) -> RedqResult<()> {
/// let engine = redq.worker();
/// engine.run_until_signal().await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkerEngine {
    id: Uuid,
    redq: Redq,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Mutex<WorkerStats>>,
    is_running: AtomicBool,
    listening: Arc<AtomicBool>,
    start_time: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for WorkerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEngine")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("is_running", &self.is_running)
            .finish_non_exhaustive()
    }
}

impl WorkerEngine {
    /// Create an engine for `redq` using `config` instead of the
    /// dispatcher's worker settings.
    pub fn new(redq: Redq, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            redq,
            config,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            is_running: AtomicBool::new(false),
            listening: Arc::new(AtomicBool::new(false)),
            start_time: Mutex::new(None),
        }
    }

    /// Spawn the polling loops and the broadcast listener.
    ///
    /// Returns immediately; use [`WorkerEngine::shutdown`] to stop.
    pub async fn start(&self) -> RedqResult<()> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RedqError::AlreadyRunning);
        }

        self.shutdown_tx.send_replace(false);
        let queues = self.redq.queue_keys().await;

        tracing::info!(
            engine = %self.id,
            concurrency = self.config.concurrency,
            ?queues,
            "Starting worker engine"
        );

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.config.concurrency {
            let worker = Worker::new(
                worker_id,
                self.redq.clone(),
                Arc::clone(&self.stats),
                self.shutdown_tx.subscribe(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        if self.config.listen_broadcasts {
            let listener = BroadcastListener::new(
                self.redq.clone(),
                Arc::clone(&self.stats),
                self.shutdown_tx.subscribe(),
                Arc::clone(&self.listening),
            );
            handles.push(tokio::spawn(listener.run()));
        }

        *self.start_time.lock().await = Some(Instant::now());
        Ok(())
    }

    /// Signal every loop to stop and wait for them to finish.
    ///
    /// Loops finish their current task first. Any still running after the
    /// configured shutdown timeout are aborted.
    pub async fn shutdown(&self) -> RedqResult<()> {
        if self
            .is_running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RedqError::NotRunning);
        }

        tracing::info!(engine = %self.id, "Shutting down worker engine");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let grace = Duration::from_secs(self.config.shutdown_timeout_secs);

        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::error!(engine = %self.id, error = %e, "Worker loop ended abnormally");
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    engine = %self.id,
                    ?grace,
                    "Shutdown timed out, aborting remaining loops"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        self.listening.store(false, Ordering::SeqCst);
        *self.start_time.lock().await = None;

        tracing::info!(engine = %self.id, "Worker engine stopped");
        Ok(())
    }

    /// Start, run until Ctrl+C or SIGTERM, then shut down gracefully.
    pub async fn run_until_signal(&self) -> RedqResult<()> {
        self.start().await?;

        match shutdown_signal().await {
            Ok(signal) => tracing::info!(engine = %self.id, signal, "Received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }

        self.shutdown().await
    }

    /// Snapshot of the engine's counters.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Whether the engine has been started and not shut down.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Whether the broadcast listener is currently subscribed.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Time since the engine was started.
    pub async fn uptime(&self) -> Option<Duration> {
        self.start_time.lock().await.map(|start| start.elapsed())
    }

    /// Unique id of this engine, used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }
}
