//! Redis broker implementation for redq.
//!
//! Queues are Redis lists, the ETA set is a sorted set and broadcasts go
//! through Redis pub/sub, so any number of processes pointed at the same
//! server and key prefix share one task system.
//!
//! # Features
//!
//! - **Distributed**: Multiple processes can share the same queues
//! - **Persistent**: Pending tasks survive process restarts
//! - **Atomic operations**: Capacity checks and ETA promotion run as Lua scripts

use super::Broker;
use crate::config::{BrokerBackendConfig, BrokerConfig, OverflowPolicy, RedisConfig};
use crate::error::{RedqError, RedqResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, IntoConnectionInfo, Script};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest BLPOP timeout sent to Redis; zero would block forever.
const MIN_BLOCK_SECS: f64 = 0.01;

/// Redis broker backend
pub struct RedisBroker {
    client: Client,
    /// Shared connection for non-blocking commands
    conn: ConnectionManager,
    /// Idle dedicated connections for BLPOP
    blocking: Mutex<Vec<MultiplexedConnection>>,
    config: RedisConfig,
    capacity: usize,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("config", &self.config)
            .field("capacity", &self.capacity)
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RedisScripts {
    /// Capacity-checked RPUSH
    push: Script,
    /// Read-and-remove of due ETA entries
    pop_due: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            push: Script::new(include_str!("scripts/push.lua")),
            pop_due: Script::new(include_str!("scripts/pop_due.lua")),
        }
    }
}

impl RedisBroker {
    /// Connect to the Redis server named in `config`.
    ///
    /// Fails with a configuration error when `config` selects another backend
    /// or asks for the blocking overflow policy, which Redis lists cannot
    /// honour.
    pub async fn new(config: &BrokerConfig) -> RedqResult<Self> {
        let redis_config = match &config.backend {
            BrokerBackendConfig::Redis(redis_config) => redis_config.clone(),
            _ => {
                return Err(RedqError::config(
                    "Redis configuration not found in broker config",
                ));
            }
        };

        if config.overflow == OverflowPolicy::Block {
            return Err(RedqError::config(
                "Blocking overflow is not supported by the Redis broker",
            ));
        }

        let mut info = redis_config.connection_string.as_str().into_connection_info()?;
        info.redis.db = redis_config.db;

        let client = Client::open(info)?;

        debug!(prefix = %config.key_prefix, db = redis_config.db, "Configuring Redis broker");

        let conn = timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|e| RedqError::broker("Timed out connecting to Redis", e))?
            .map_err(|e| RedqError::broker("Failed to create Redis connection manager", e))?;

        info!(db = redis_config.db, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            config: redis_config,
            capacity: config.max_queue_size,
            scripts: RedisScripts::new(),
        })
    }

    /// Take an idle blocking connection or open a new one.
    async fn checkout(&self) -> RedqResult<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }

        timeout(CONNECT_TIMEOUT, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|e| RedqError::broker("Timed out opening a blocking connection", e))?
            .map_err(|e| RedqError::broker("Failed to open a blocking connection", e))
    }

    async fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().await;
        if idle.len() < self.config.pool_size as usize {
            idle.push(conn);
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, key: &str, payload: Vec<u8>) -> RedqResult<()> {
        let mut conn = self.conn.clone();

        let length: i64 = self
            .scripts
            .push
            .key(key)
            .arg(payload)
            .arg(self.capacity)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RedqError::broker(format!("Failed to push to '{}'", key), e))?;

        if length < 0 {
            return Err(RedqError::QueueFull {
                key: key.to_string(),
                capacity: self.capacity,
            });
        }

        debug!(key, length, "Pushed payload");
        Ok(())
    }

    async fn pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> RedqResult<Option<(String, Vec<u8>)>> {
        if keys.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        let mut conn = self.checkout().await?;
        let result: redis::RedisResult<Option<(String, Vec<u8>)>> = redis::cmd("BLPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64().max(MIN_BLOCK_SECS))
            .query_async(&mut conn)
            .await;

        match result {
            Ok(popped) => {
                self.checkin(conn).await;
                Ok(popped)
            }
            // The connection may be broken; let it go rather than pooling it.
            Err(e) => Err(RedqError::broker("Failed to pop from queues", e)),
        }
    }

    async fn add_delayed(&self, key: &str, payload: Vec<u8>, score: f64) -> RedqResult<bool> {
        let mut conn = self.conn.clone();

        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedqError::broker("Failed to add ETA entry", e))?;

        Ok(added == 1)
    }

    async fn pop_due(&self, key: &str, max_score: f64) -> RedqResult<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();

        let due: Vec<Vec<u8>> = self
            .scripts
            .pop_due
            .key(key)
            .arg(max_score)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RedqError::broker("Failed to pop due ETA entries", e))?;

        if !due.is_empty() {
            debug!(key, count = due.len(), "Took due ETA entries");
        }
        Ok(due)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> RedqResult<usize> {
        let mut conn = self.conn.clone();

        let receivers: usize = conn
            .publish(channel, payload)
            .await
            .map_err(|e| RedqError::broker("Failed to publish broadcast", e))?;

        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> RedqResult<BoxStream<'static, Vec<u8>>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RedqError::broker("Failed to open pub/sub connection", e))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| RedqError::broker(format!("Failed to subscribe to '{}'", channel), e))?;

        debug!(channel, "Subscribed to broadcast channel");

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }

    async fn len(&self, key: &str) -> RedqResult<usize> {
        let mut conn = self.conn.clone();
        conn.llen(key)
            .await
            .map_err(|e| RedqError::broker("Failed to read queue length", e))
    }

    async fn delayed_len(&self, key: &str) -> RedqResult<usize> {
        let mut conn = self.conn.clone();
        conn.zcard(key)
            .await
            .map_err(|e| RedqError::broker("Failed to read ETA set size", e))
    }

    async fn health_check(&self) -> RedqResult<()> {
        let mut conn = self.conn.clone();

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedqError::broker("Redis health check failed", e))?;

        if pong != "PONG" {
            warn!(response = %pong, "Unexpected PING response");
            return Err(RedqError::BrokerError {
                message: "Redis health check failed: unexpected response".to_string(),
                source: None,
            });
        }

        Ok(())
    }
}
