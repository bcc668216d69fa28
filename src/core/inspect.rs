//! Point-in-time snapshot of a dispatcher's broker state.

use super::Redq;
use crate::error::RedqResult;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Depth and routing of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    /// Queue name
    pub name: String,
    /// Broker key of the backing list
    pub broker_key: String,
    /// Position in the polling order, 0 first
    pub priority: usize,
    /// Number of pending payloads
    pub depth: usize,
}

/// State of the shared ETA set.
#[derive(Debug, Clone, Serialize)]
pub struct EtaInfo {
    /// Sorted set key
    pub key: String,
    /// Entries not yet promoted
    pub pending: usize,
}

/// Snapshot returned by [`Redq::info`].
#[derive(Debug, Clone, Serialize)]
pub struct RedqInfo {
    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
    /// Declared queues in priority order
    pub queues: Vec<QueueInfo>,
    /// ETA set
    pub eta: EtaInfo,
    /// Broadcast channel name
    pub broadcast_channel: String,
    /// Registered task names, sorted
    pub tasks: Vec<String>,
}

impl RedqInfo {
    /// Render as pretty JSON with keys in sorted order.
    pub fn to_json(&self) -> RedqResult<String> {
        // Round-tripping through `Value` sorts object keys.
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Total pending payloads across all queues.
    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|q| q.depth).sum()
    }
}

impl Redq {
    /// Snapshot queue depths, the ETA backlog and registered tasks.
    pub async fn info(&self) -> RedqResult<RedqInfo> {
        let broker = self.broker();

        let mut queues = Vec::new();
        for (priority, queue) in self.queues().await.into_iter().enumerate() {
            let depth = broker.len(queue.broker_key()).await?;
            queues.push(QueueInfo {
                name: queue.name().to_string(),
                broker_key: queue.broker_key().to_string(),
                priority,
                depth,
            });
        }

        let eta_key = self.eta_key();
        let pending = broker.delayed_len(&eta_key).await?;

        Ok(RedqInfo {
            generated_at: Utc::now(),
            queues,
            eta: EtaInfo {
                key: eta_key,
                pending,
            },
            broadcast_channel: self.broadcast_channel(),
            tasks: self.registry().names().await,
        })
    }
}
