//! Small helpers shared by the producer and worker sides.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch as a float, the score unit of the ETA set.
pub fn unix_timestamp(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Current time as an ETA score.
pub fn now_timestamp() -> f64 {
    unix_timestamp(SystemTime::now())
}

/// Exponential backoff in milliseconds, capped at 30 seconds.
///
/// `seed` offsets concurrent callers from one another.
pub fn calculate_backoff(attempt: u32, base_ms: u64, seed: u64) -> u64 {
    const MAX_BACKOFF_MS: u64 = 30_000;

    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(1u64 << exponent);
    let spread = if base_ms == 0 { 0 } else { seed.wrapping_mul(37) % base_ms };

    delay.saturating_add(spread).min(MAX_BACKOFF_MS)
}

/// Backoff as a `Duration`.
pub fn backoff_duration(attempt: u32, base_ms: u64, seed: u64) -> Duration {
    Duration::from_millis(calculate_backoff(attempt, base_ms, seed))
}

/// Wait for Ctrl+C or, on Unix, SIGTERM.
///
/// Returns the name of the signal that arrived.
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}
