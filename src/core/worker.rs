//! Worker loops for redq.
//!
//! A [`Worker`] repeatedly promotes due ETA entries, pops the next payload
//! from the declared queues in priority order and runs its handler. A
//! [`BroadcastListener`] subscribes to the broadcast channel and runs every
//! message it receives. Both are spawned and stopped by
//! [`WorkerEngine`](super::WorkerEngine).

use super::Redq;
use crate::error::{RedqError, RedqResult};
use crate::utils::{backoff_duration, now_timestamp};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A payload was popped and its handler succeeded
    Executed,
    /// A payload was popped but could not be run successfully
    Failed,
    /// No payload arrived within the poll timeout
    Idle,
}

/// Counters shared by all loops of one engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    /// Payloads whose handler succeeded
    pub executed: u64,
    /// Payloads whose handler failed or that could not be decoded
    pub failed: u64,
    /// ETA entries moved onto their queue
    pub promoted: u64,
    /// Broadcast messages run
    pub broadcasts: u64,
    /// Payloads naming a task this process does not know
    pub unknown_tasks: u64,
    /// Broker calls that failed
    pub broker_errors: u64,
}

/// One polling loop.
pub struct Worker {
    id: usize,
    redq: Redq,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// Create a worker that stops once `shutdown` turns `true`.
    pub fn new(
        id: usize,
        redq: Redq,
        stats: Arc<Mutex<WorkerStats>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            redq,
            stats,
            shutdown,
        }
    }

    /// Poll until shutdown is requested.
    ///
    /// Every pop is bounded by the configured poll timeout, so shutdown is
    /// observed between polls and never interrupts a pop or a running task.
    pub async fn run(mut self) {
        tracing::info!(worker_id = self.id, "Worker starting");
        let base_ms = self.redq.config().worker.error_backoff_ms;
        let mut errors = 0u32;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(_) => errors = 0,
                Err(e) => {
                    errors = errors.saturating_add(1);
                    self.stats.lock().await.broker_errors += 1;

                    let backoff = backoff_duration(errors, base_ms, self.id as u64);
                    tracing::warn!(
                        worker_id = self.id,
                        error = %e,
                        ?backoff,
                        "Broker error, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(worker_id = self.id, "Worker stopped");
    }

    /// Promote due ETA entries, then pop and run at most one payload.
    ///
    /// Only broker failures are returned as errors; handler failures are
    /// logged, counted and reported as [`PollOutcome::Failed`].
    pub async fn run_once(&self) -> RedqResult<PollOutcome> {
        self.promote_due().await?;

        let keys = self.redq.queue_keys().await;
        let timeout = self.redq.config().worker.poll_timeout();

        match self.redq.broker().pop(&keys, timeout).await? {
            Some((key, bytes)) => Ok(self.execute(&key, &bytes).await),
            None => Ok(PollOutcome::Idle),
        }
    }

    /// Move every due ETA entry onto the queue named in its payload.
    ///
    /// Removal from the ETA set is atomic, so when several workers promote
    /// at once each entry is moved by exactly one of them. Returns the
    /// number of entries moved.
    ///
    /// Entries that cannot be pushed are put back in the ETA set. Every
    /// entry is attempted even after a failure; an error is returned only
    /// when some entry could be neither pushed nor put back.
    pub async fn promote_due(&self) -> RedqResult<usize> {
        let broker = self.redq.broker();
        let eta_key = self.redq.eta_key();
        let now = now_timestamp();

        let due = broker.pop_due(&eta_key, now).await?;
        let mut promoted = 0;
        let mut stranded = Vec::new();

        for bytes in due {
            let payload = match self.redq.serializer().decode(&bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Dropping undecodable ETA entry");
                    continue;
                }
            };

            let queue = self.redq.queue(&payload.queue).await;
            if let Err(e) = broker.push(queue.broker_key(), bytes.clone()).await {
                tracing::warn!(
                    worker_id = self.id,
                    task = %payload.name,
                    queue = %queue.name(),
                    error = %e,
                    "Failed to promote ETA entry"
                );
                if let Err(e) = broker.add_delayed(&eta_key, bytes.clone(), now).await {
                    tracing::warn!(worker_id = self.id, task = %payload.name, error = %e, "Failed to restore ETA entry");
                    stranded.push((payload.name, bytes));
                }
                continue;
            }

            tracing::debug!(
                worker_id = self.id,
                task = %payload.name,
                queue = %queue.name(),
                "Promoted ETA entry"
            );
            promoted += 1;
        }

        if promoted > 0 {
            self.stats.lock().await.promoted += promoted as u64;
        }

        // One more attempt for entries the first pass could not restore.
        let mut lost = None;
        for (task, bytes) in stranded {
            if let Err(e) = broker.add_delayed(&eta_key, bytes.clone(), now).await {
                tracing::error!(
                    worker_id = self.id,
                    %task,
                    payload = %String::from_utf8_lossy(&bytes),
                    error = %e,
                    "Lost ETA entry"
                );
                if lost.is_none() {
                    lost = Some(e);
                }
            }
        }

        match lost {
            Some(e) => Err(e),
            None => Ok(promoted),
        }
    }

    async fn execute(&self, key: &str, bytes: &[u8]) -> PollOutcome {
        let payload = match self.redq.serializer().decode(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(worker_id = self.id, %key, error = %e, "Dropping undecodable payload");
                self.stats.lock().await.failed += 1;
                return PollOutcome::Failed;
            }
        };

        tracing::debug!(worker_id = self.id, task = %payload.name, queue = %payload.queue, "Running task");

        match self.redq.registry().execute(payload).await {
            Ok(()) => {
                self.stats.lock().await.executed += 1;
                PollOutcome::Executed
            }
            Err(RedqError::TaskNotFound { name }) => {
                tracing::error!(worker_id = self.id, task = %name, "No handler registered for task");
                self.stats.lock().await.unknown_tasks += 1;
                PollOutcome::Failed
            }
            Err(_) => {
                // Already logged by the registry.
                self.stats.lock().await.failed += 1;
                PollOutcome::Failed
            }
        }
    }
}

/// Runs broadcast messages for one engine.
pub struct BroadcastListener {
    redq: Redq,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown: watch::Receiver<bool>,
    listening: Arc<AtomicBool>,
}

impl BroadcastListener {
    /// Create a listener; `listening` is `true` while it is subscribed.
    pub fn new(
        redq: Redq,
        stats: Arc<Mutex<WorkerStats>>,
        shutdown: watch::Receiver<bool>,
        listening: Arc<AtomicBool>,
    ) -> Self {
        Self {
            redq,
            stats,
            shutdown,
            listening,
        }
    }

    /// Listen until shutdown is requested, resubscribing if the
    /// subscription drops.
    pub async fn run(mut self) {
        let channel = self.redq.broadcast_channel();
        let base_ms = self.redq.config().worker.error_backoff_ms;
        let mut attempt = 0u32;

        tracing::info!(%channel, "Broadcast listener starting");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.redq.broker().subscribe(&channel).await {
                Ok(mut stream) => {
                    attempt = 0;
                    self.listening.store(true, Ordering::SeqCst);

                    loop {
                        tokio::select! {
                            changed = self.shutdown.changed() => {
                                if changed.is_err() || *self.shutdown.borrow() {
                                    self.listening.store(false, Ordering::SeqCst);
                                    tracing::info!(%channel, "Broadcast listener stopped");
                                    return;
                                }
                            }
                            message = stream.next() => match message {
                                Some(bytes) => self.execute(&bytes).await,
                                None => {
                                    tracing::warn!(%channel, "Broadcast subscription ended");
                                    break;
                                }
                            },
                        }
                    }

                    self.listening.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    self.stats.lock().await.broker_errors += 1;
                    tracing::warn!(%channel, error = %e, "Failed to subscribe to broadcasts");
                }
            }

            attempt = attempt.saturating_add(1);
            let backoff = backoff_duration(attempt, base_ms, 0);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.listening.store(false, Ordering::SeqCst);
        tracing::info!(%channel, "Broadcast listener stopped");
    }

    async fn execute(&self, bytes: &[u8]) {
        let payload = match self.redq.serializer().decode(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Dropping undecodable broadcast");
                self.stats.lock().await.failed += 1;
                return;
            }
        };

        let name = payload.name.clone();
        match self.redq.registry().execute(payload).await {
            Ok(()) => self.stats.lock().await.broadcasts += 1,
            Err(RedqError::TaskNotFound { .. }) => {
                tracing::error!(task = %name, "No handler registered for broadcast task");
                self.stats.lock().await.unknown_tasks += 1;
            }
            Err(_) => self.stats.lock().await.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EtaMode, RedqConfig};
    use crate::queue::{Broker, InMemoryBroker};
    use crate::task::{Invocation, Payload};
    use async_trait::async_trait;
    use futures::future::join_all;
    use futures::stream::BoxStream;
    use std::sync::atomic::AtomicUsize;
    use serde_json::{Map, json};
    use std::time::{Duration, SystemTime};

    async fn noop(_payload: Payload) -> RedqResult<()> {
        Ok(())
    }

    async fn fail(_payload: Payload) -> RedqResult<()> {
        Err(RedqError::execution("boom"))
    }

    fn worker(id: usize, redq: &Redq, stats: &Arc<Mutex<WorkerStats>>) -> Worker {
        // The sender is dropped; these workers are driven by hand.
        let (_tx, rx) = watch::channel(false);
        Worker::new(id, redq.clone(), stats.clone(), rx)
    }

    #[tokio::test]
    async fn test_run_once_outcomes() {
        let redq = Redq::new(RedqConfig::testing()).await.unwrap();
        redq.queue("default").await;
        let ok = redq.task("ok", noop).await.unwrap();
        let bad = redq.task("bad", fail).await.unwrap();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let worker = worker(0, &redq, &stats);

        ok.delay(Invocation::new()).await.unwrap();
        bad.delay(Invocation::new()).await.unwrap();

        assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Executed);
        assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Failed);
        assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Idle);

        let stats = stats.lock().await;
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_counted_not_fatal() {
        let redq = Redq::new(RedqConfig::testing()).await.unwrap();
        let queue = redq.queue("default").await;
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let worker = worker(0, &redq, &stats);

        let stranger = Payload {
            name: "not_registered".to_string(),
            queue: "default".to_string(),
            args: vec![],
            kwargs: Map::new(),
        };
        let bytes = redq.serializer().encode(&stranger).unwrap();
        redq.broker().push(queue.broker_key(), bytes).await.unwrap();
        redq.broker()
            .push(queue.broker_key(), b"not json".to_vec())
            .await
            .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Failed);
        assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Failed);

        let stats = stats.lock().await;
        assert_eq!(stats.unknown_tasks, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_promotion_moves_each_entry_once() {
        let mut config = RedqConfig::testing();
        config.eta = EtaMode::Deferred;
        let redq = Redq::new(config).await.unwrap();
        let queue = redq.queue("default").await;
        let task = redq.task("later", noop).await.unwrap();

        let past = SystemTime::now() - Duration::from_secs(1);
        for i in 0..10 {
            task.delay(Invocation::new().arg(i).eta(past)).await.unwrap();
        }
        assert_eq!(redq.broker().delayed_len(&redq.eta_key()).await.unwrap(), 10);
        assert_eq!(redq.broker().len(queue.broker_key()).await.unwrap(), 0);

        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let workers: Vec<Worker> = (0..8).map(|id| worker(id, &redq, &stats)).collect();
        let moved: usize = join_all(workers.iter().map(Worker::promote_due))
            .await
            .into_iter()
            .map(Result::unwrap)
            .sum();

        assert_eq!(moved, 10);
        assert_eq!(stats.lock().await.promoted, 10);
        assert_eq!(redq.broker().len(queue.broker_key()).await.unwrap(), 10);
        assert_eq!(redq.broker().delayed_len(&redq.eta_key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_promotion_targets_payload_queue() {
        let mut config = RedqConfig::testing();
        config.eta = EtaMode::Deferred;
        let redq = Redq::new(config).await.unwrap();
        redq.queue("default").await;
        let task = redq.task("later", noop).await.unwrap();

        let past = SystemTime::now() - Duration::from_secs(1);
        task.delay(Invocation::new().queue("reports").eta(past))
            .await
            .unwrap();

        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        assert_eq!(worker(0, &redq, &stats).promote_due().await.unwrap(), 1);

        let reports = redq.queue("reports").await;
        assert_eq!(redq.broker().len(reports.broker_key()).await.unwrap(), 1);
    }

    /// Wraps the in-memory broker and fails selected writes on demand.
    struct FlakyBroker {
        inner: InMemoryBroker,
        fail_push: AtomicBool,
        delayed_failures: AtomicUsize,
    }

    impl FlakyBroker {
        fn new() -> Self {
            Self {
                inner: InMemoryBroker::new(),
                fail_push: AtomicBool::new(false),
                delayed_failures: AtomicUsize::new(0),
            }
        }

        fn unavailable() -> RedqError {
            RedqError::broker("connection reset", std::io::Error::other("reset"))
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn push(&self, key: &str, payload: Vec<u8>) -> RedqResult<()> {
            if self.fail_push.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.inner.push(key, payload).await
        }

        async fn pop(
            &self,
            keys: &[String],
            timeout: Duration,
        ) -> RedqResult<Option<(String, Vec<u8>)>> {
            self.inner.pop(keys, timeout).await
        }

        async fn add_delayed(&self, key: &str, payload: Vec<u8>, score: f64) -> RedqResult<bool> {
            let failing = self
                .delayed_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Self::unavailable());
            }
            self.inner.add_delayed(key, payload, score).await
        }

        async fn pop_due(&self, key: &str, max_score: f64) -> RedqResult<Vec<Vec<u8>>> {
            self.inner.pop_due(key, max_score).await
        }

        async fn publish(&self, channel: &str, payload: Vec<u8>) -> RedqResult<usize> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> RedqResult<BoxStream<'static, Vec<u8>>> {
            self.inner.subscribe(channel).await
        }

        async fn len(&self, key: &str) -> RedqResult<usize> {
            self.inner.len(key).await
        }

        async fn delayed_len(&self, key: &str) -> RedqResult<usize> {
            self.inner.delayed_len(key).await
        }

        async fn health_check(&self) -> RedqResult<()> {
            self.inner.health_check().await
        }
    }

    async fn flaky_redq() -> (Redq, Arc<FlakyBroker>) {
        let mut config = RedqConfig::testing();
        config.eta = EtaMode::Deferred;
        let broker = Arc::new(FlakyBroker::new());
        let redq = Redq::with_shared_broker(config, broker.clone()).unwrap();
        redq.queue("default").await;
        let task = redq.task("later", noop).await.unwrap();

        let past = SystemTime::now() - Duration::from_secs(1);
        for i in 0..5 {
            task.delay(Invocation::new().arg(i).eta(past)).await.unwrap();
        }
        (redq, broker)
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_every_entry() {
        let (redq, broker) = flaky_redq().await;
        broker.fail_push.store(true, Ordering::SeqCst);
        broker.delayed_failures.store(1, Ordering::SeqCst);

        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let worker = worker(0, &redq, &stats);
        assert_eq!(worker.promote_due().await.unwrap(), 0);
        assert_eq!(redq.broker().delayed_len(&redq.eta_key()).await.unwrap(), 5);

        // Once the broker recovers the entries are promoted normally.
        broker.fail_push.store(false, Ordering::SeqCst);
        assert_eq!(worker.promote_due().await.unwrap(), 5);
        let queue = redq.queue("default").await;
        assert_eq!(redq.broker().len(queue.broker_key()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unrestorable_entry_is_reported_after_the_rest() {
        let (redq, broker) = flaky_redq().await;
        broker.fail_push.store(true, Ordering::SeqCst);
        // Every first-pass restore fails, then the retry of the first entry.
        broker.delayed_failures.store(6, Ordering::SeqCst);

        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let err = worker(0, &redq, &stats).promote_due().await.unwrap_err();
        assert!(matches!(err, RedqError::BrokerError { .. }));
        assert_eq!(redq.broker().delayed_len(&redq.eta_key()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_listener_runs_broadcasts() {
        let redq = Redq::new(RedqConfig::testing()).await.unwrap();
        redq.queue("default").await;
        let task = redq.task("reload", noop).await.unwrap();

        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let listening = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(false);
        let listener = BroadcastListener::new(redq.clone(), stats.clone(), rx, listening.clone());
        let handle = tokio::spawn(listener.run());

        while !listening.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let receivers = task
            .broadcast(Invocation::new().arg(json!({"scope": "all"})))
            .await
            .unwrap();
        assert_eq!(receivers, 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while stats.lock().await.broadcasts == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send_replace(true);
        handle.await.unwrap();
        assert!(!listening.load(Ordering::SeqCst));
    }
}
