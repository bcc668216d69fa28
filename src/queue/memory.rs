//! In-memory broker for redq.
//!
//! Lists, the delayed sorted set and broadcast channels all live inside the
//! process. Every operation runs under a single lock, which gives the same
//! atomicity a real broker provides, so the in-memory backend is a faithful
//! stand-in for tests and single-process deployments.
//!
//! Lists can be bounded with `max_queue_size`; what happens on overflow is
//! declared explicitly through [`OverflowPolicy`].

use super::Broker;
use crate::config::{BrokerConfig, OverflowPolicy};
use crate::error::{RedqError, RedqResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;

/// Buffered messages per broadcast channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct BrokerState {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    delayed: HashMap<String, Vec<DelayedEntry>>,
}

#[derive(Debug)]
struct DelayedEntry {
    score: f64,
    payload: Vec<u8>,
}

/// In-memory broker implementation
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    /// Woken on every push
    pushed: Notify,
    /// Woken on every pop
    popped: Notify,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an unbounded in-memory broker
    pub fn new() -> Self {
        Self::bounded(0, OverflowPolicy::Reject)
    }

    /// Create a broker whose lists hold at most `capacity` payloads (0 = unlimited)
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            pushed: Notify::new(),
            popped: Notify::new(),
            channels: Mutex::new(HashMap::new()),
            capacity,
            overflow,
        }
    }

    /// Create a broker from the broker section of the configuration
    pub fn with_config(config: &BrokerConfig) -> Self {
        Self::bounded(config.max_queue_size, config.overflow)
    }

    /// Number of live subscriptions on `channel`
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn push(&self, key: &str, payload: Vec<u8>) -> RedqResult<()> {
        loop {
            // Register interest before checking so a pop between the check
            // and the wait is not missed.
            let room = self.popped.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let len = state.lists.get(key).map_or(0, VecDeque::len);

                if self.capacity == 0 || len < self.capacity {
                    state
                        .lists
                        .entry(key.to_string())
                        .or_default()
                        .push_back(payload);
                    drop(state);
                    self.pushed.notify_waiters();
                    return Ok(());
                }

                if self.overflow == OverflowPolicy::Reject {
                    return Err(RedqError::QueueFull {
                        key: key.to_string(),
                        capacity: self.capacity,
                    });
                }
            }

            tracing::trace!(key, "Queue full, waiting for room");
            room.await;
        }
    }

    async fn pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> RedqResult<Option<(String, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;

        loop {
            let arrival = self.pushed.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let popped = {
                let mut state = self.state.lock().await;
                keys.iter().find_map(|key| {
                    state
                        .lists
                        .get_mut(key)
                        .and_then(VecDeque::pop_front)
                        .map(|payload| (key.clone(), payload))
                })
            };

            if let Some(hit) = popped {
                self.popped.notify_waiters();
                return Ok(Some(hit));
            }

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn add_delayed(&self, key: &str, payload: Vec<u8>, score: f64) -> RedqResult<bool> {
        let mut state = self.state.lock().await;
        let entries = state.delayed.entry(key.to_string()).or_default();

        if entries.iter().any(|entry| entry.payload == payload) {
            return Ok(false);
        }

        // Keep ascending score order; equal scores keep insertion order.
        let position = entries.partition_point(|entry| entry.score <= score);
        entries.insert(position, DelayedEntry { score, payload });
        Ok(true)
    }

    async fn pop_due(&self, key: &str, max_score: f64) -> RedqResult<Vec<Vec<u8>>> {
        let mut state = self.state.lock().await;
        let Some(entries) = state.delayed.get_mut(key) else {
            return Ok(Vec::new());
        };

        let due = entries.partition_point(|entry| entry.score <= max_score);
        Ok(entries.drain(..due).map(|entry| entry.payload).collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> RedqResult<usize> {
        let channels = self.channels.lock().await;
        let receivers = channels
            .get(channel)
            .and_then(|sender| sender.send(payload).ok())
            .unwrap_or(0);
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> RedqResult<BoxStream<'static, Vec<u8>>> {
        let receiver = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let channel = channel.to_string();
        let stream = stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(%channel, skipped, "Broadcast subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn len(&self, key: &str) -> RedqResult<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn delayed_len(&self, key: &str) -> RedqResult<usize> {
        let state = self.state.lock().await;
        Ok(state.delayed.get(key).map_or(0, Vec::len))
    }

    async fn health_check(&self) -> RedqResult<()> {
        let state = self.state.lock().await;
        let pending: usize = state.lists.values().map(VecDeque::len).sum();
        let delayed: usize = state.delayed.values().map(Vec::len).sum();

        tracing::debug!(pending, delayed, "In-memory broker health check");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_push_pop_is_fifo() {
        let broker = InMemoryBroker::new();
        for i in 0..3u8 {
            broker.push("q", vec![i]).await.unwrap();
        }

        for i in 0..3u8 {
            let (key, payload) = broker
                .pop(&keys(&["q"]), Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(key, "q");
            assert_eq!(payload, vec![i]);
        }
        assert_eq!(broker.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_checks_keys_in_order() {
        let broker = InMemoryBroker::new();
        broker.push("low", b"l".to_vec()).await.unwrap();
        broker.push("high", b"h".to_vec()).await.unwrap();

        let order = keys(&["high", "low"]);
        let first = broker.pop(&order, Duration::from_millis(10)).await.unwrap();
        let second = broker.pop(&order, Duration::from_millis(10)).await.unwrap();

        assert_eq!(first.unwrap().0, "high");
        assert_eq!(second.unwrap().0, "low");
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let broker = InMemoryBroker::new();
        let started = std::time::Instant::now();
        let result = broker
            .pop(&keys(&["q"]), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_push() {
        let broker = Arc::new(InMemoryBroker::new());
        let popper = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.pop(&keys(&["q"]), Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push("q", b"late".to_vec()).await.unwrap();

        let popped = popper.await.unwrap().unwrap().unwrap();
        assert_eq!(popped.1, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_reject_policy_leaves_queue_unchanged() {
        let broker = InMemoryBroker::bounded(1, OverflowPolicy::Reject);
        broker.push("q", b"a".to_vec()).await.unwrap();

        let err = broker.push("q", b"b".to_vec()).await.unwrap_err();
        assert!(matches!(err, RedqError::QueueFull { capacity: 1, .. }));
        assert_eq!(broker.len("q").await.unwrap(), 1);

        let (_, payload) = broker
            .pop(&keys(&["q"]), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_room() {
        let broker = Arc::new(InMemoryBroker::bounded(1, OverflowPolicy::Block));
        broker.push("q", b"a".to_vec()).await.unwrap();

        let pusher = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.push("q", b"b".to_vec()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        broker
            .pop(&keys(&["q"]), Duration::from_millis(10))
            .await
            .unwrap();
        pusher.await.unwrap().unwrap();

        let (_, payload) = broker
            .pop(&keys(&["q"]), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_delayed_set_is_insert_if_absent_and_ordered() {
        let broker = InMemoryBroker::new();
        assert!(broker.add_delayed("eta", b"late".to_vec(), 30.0).await.unwrap());
        assert!(broker.add_delayed("eta", b"early".to_vec(), 10.0).await.unwrap());
        assert!(!broker.add_delayed("eta", b"early".to_vec(), 5.0).await.unwrap());
        assert!(broker.add_delayed("eta", b"middle".to_vec(), 20.0).await.unwrap());
        assert_eq!(broker.delayed_len("eta").await.unwrap(), 3);

        let due = broker.pop_due("eta", 20.0).await.unwrap();
        assert_eq!(due, vec![b"early".to_vec(), b"middle".to_vec()]);
        assert_eq!(broker.delayed_len("eta").await.unwrap(), 1);

        assert!(broker.pop_due("eta", 20.0).await.unwrap().is_empty());
        assert!(broker.pop_due("missing", 100.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.publish("bc", b"nobody".to_vec()).await.unwrap(), 0);

        let mut first = broker.subscribe("bc").await.unwrap();
        let mut second = broker.subscribe("bc").await.unwrap();
        assert_eq!(broker.subscriber_count("bc").await, 2);

        assert_eq!(broker.publish("bc", b"hello".to_vec()).await.unwrap(), 2);
        assert_eq!(first.next().await.unwrap(), b"hello".to_vec());
        assert_eq!(second.next().await.unwrap(), b"hello".to_vec());

        drop(second);
        assert_eq!(broker.subscriber_count("bc").await, 1);
        assert_eq!(broker.publish("bc", b"again".to_vec()).await.unwrap(), 1);
    }
}
