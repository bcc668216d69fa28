//! Periodic task scheduler.
//!
//! The scheduler is a producer: on every tick it calls
//! [`Task::delay`](crate::task::Task::delay) for each entry whose period has
//! elapsed. It does not run tasks itself, so exactly one scheduler should run
//! per deployment alongside any number of workers.

use super::Redq;
use crate::error::{RedqError, RedqResult};
use crate::task::{Invocation, Task};
use crate::utils::shutdown_signal;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug)]
struct ScheduleEntry {
    task: Task,
    every: Duration,
    invocation: Invocation,
    next_due: Instant,
}

/// Fires registered tasks at fixed intervals.
///
/// ```rust,no_run
/// use redq::prelude::*;
/// use std::time::Duration;
///
/// # async fn example(redq: Redq, cleanup: Task) -> RedqResult<()> {
/// redq.scheduler()
///     .every(Duration::from_secs(300), &cleanup, Invocation::new())?
///     .run_until_signal()
///     .await
/// # }
/// ```
#[derive(Debug)]
pub struct Scheduler {
    redq: Redq,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    /// An empty schedule for `redq`.
    pub fn new(redq: Redq) -> Self {
        Self {
            redq,
            entries: Vec::new(),
        }
    }

    /// Fire `task` with `invocation` every `every`, first one period from now.
    pub fn every(mut self, every: Duration, task: &Task, invocation: Invocation) -> RedqResult<Self> {
        if every.is_zero() {
            return Err(RedqError::config(format!(
                "Schedule period for task '{}' must be greater than 0",
                task.name()
            )));
        }

        tracing::debug!(task = %task.name(), ?every, "Scheduled periodic task");
        self.entries.push(ScheduleEntry {
            task: task.clone(),
            every,
            invocation,
            next_due: Instant::now() + every,
        });
        Ok(self)
    }

    /// Number of scheduled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enqueue every entry due at `now` and return how many were enqueued.
    ///
    /// An entry fires at most once per tick even if several periods were
    /// missed; its next run is realigned to the original cadence. A failed
    /// enqueue is logged and the entry still advances.
    pub async fn tick(&mut self, now: Instant) -> usize {
        let mut fired = 0;

        for entry in &mut self.entries {
            if now < entry.next_due {
                continue;
            }

            match entry.task.delay(entry.invocation.clone()).await {
                Ok(()) => {
                    tracing::debug!(task = %entry.task.name(), "Periodic task enqueued");
                    fired += 1;
                }
                Err(e) => {
                    tracing::error!(task = %entry.task.name(), error = %e, "Periodic enqueue failed");
                }
            }

            let behind = now.duration_since(entry.next_due);
            let skipped = (behind.as_nanos() / entry.every.as_nanos()) as u64;
            if skipped > 0 {
                tracing::warn!(task = %entry.task.name(), skipped, "Skipped missed periods");
            }
            entry.next_due = now + entry.every - duration_rem(behind, entry.every);
        }

        fired
    }

    /// Tick at the configured interval until `shutdown` turns `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RedqResult<()> {
        let tick = Duration::from_millis(self.redq.config().scheduler.tick_ms);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(entries = self.entries.len(), ?tick, "Scheduler starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                now = interval.tick() => {
                    self.tick(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Run until Ctrl+C or SIGTERM.
    pub async fn run_until_signal(self) -> RedqResult<()> {
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(signal) => tracing::info!(signal, "Received shutdown signal"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
            tx.send_replace(true);
        });

        self.run(rx).await
    }
}

fn duration_rem(value: Duration, period: Duration) -> Duration {
    let nanos = value.as_nanos() % period.as_nanos();
    Duration::from_nanos(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedqConfig;
    use crate::task::Payload;

    async fn noop(_payload: Payload) -> RedqResult<()> {
        Ok(())
    }

    async fn setup() -> (Redq, Task) {
        let redq = Redq::new(RedqConfig::testing()).await.unwrap();
        redq.queue("default").await;
        let task = redq.task("cleanup", noop).await.unwrap();
        (redq, task)
    }

    async fn depth(redq: &Redq) -> usize {
        let queue = redq.queue("default").await;
        redq.broker().len(queue.broker_key()).await.unwrap()
    }

    #[tokio::test]
    async fn test_zero_period_is_rejected() {
        let (redq, task) = setup().await;
        let err = redq
            .scheduler()
            .every(Duration::ZERO, &task, Invocation::new())
            .unwrap_err();
        assert!(matches!(err, RedqError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_tick_fires_when_due() {
        let (redq, task) = setup().await;
        let mut scheduler = redq
            .scheduler()
            .every(Duration::from_secs(10), &task, Invocation::new().arg(1))
            .unwrap();
        let start = Instant::now();
        assert_eq!(scheduler.len(), 1);

        assert_eq!(scheduler.tick(start).await, 0);
        assert_eq!(scheduler.tick(start + Duration::from_secs(10)).await, 1);
        assert_eq!(scheduler.tick(start + Duration::from_secs(15)).await, 0);
        assert_eq!(scheduler.tick(start + Duration::from_secs(21)).await, 1);
        assert_eq!(depth(&redq).await, 2);
    }

    #[tokio::test]
    async fn test_missed_periods_fire_once() {
        let (redq, task) = setup().await;
        let mut scheduler = redq
            .scheduler()
            .every(Duration::from_secs(10), &task, Invocation::new())
            .unwrap();
        let start = Instant::now();

        // Five periods late: one enqueue, and the cadence is kept.
        assert_eq!(scheduler.tick(start + Duration::from_secs(55)).await, 1);
        assert_eq!(scheduler.tick(start + Duration::from_secs(59)).await, 0);
        assert_eq!(scheduler.tick(start + Duration::from_secs(61)).await, 1);
        assert_eq!(depth(&redq).await, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (redq, task) = setup().await;
        let scheduler = redq
            .scheduler()
            .every(Duration::from_millis(30), &task, Invocation::new())
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send_replace(true);
        handle.await.unwrap().unwrap();

        assert!(depth(&redq).await >= 2);
    }
}
