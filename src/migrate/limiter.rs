//! Bandwidth limiting for the copy loop.

use std::time::{Duration, Instant};

/// Keeps cumulative throughput at or below a configured rate by inserting
/// delay after each chunk. Without a limit, pipe and socket backpressure
/// do the pacing.
pub struct RateLimiter {
    bytes_per_sec: Option<u64>,
    started: Instant,
}

impl RateLimiter {
    pub fn new(limit_mbps: Option<u64>) -> Self {
        Self {
            bytes_per_sec: limit_mbps.map(|mbps| mbps * 1024 * 1024),
            started: Instant::now(),
        }
    }

    /// Sleeps until `total_bytes` over the elapsed time fits the limit.
    pub async fn throttle(&self, total_bytes: u64) {
        let Some(bps) = self.bytes_per_sec else {
            return;
        };
        let expected = total_bytes as f64 / bps as f64;
        let actual = self.started.elapsed().as_secs_f64();
        if expected > actual {
            tokio::time::sleep(Duration::from_secs_f64(expected - actual)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throttle_enforces_rate() {
        // 1 MB/s limit, 512 KiB "transferred": at least ~0.5s must elapse.
        let limiter = RateLimiter::new(Some(1));
        let start = Instant::now();
        limiter.throttle(512 * 1024).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn no_limit_never_sleeps() {
        let limiter = RateLimiter::new(None);
        let start = Instant::now();
        limiter.throttle(u64::MAX).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
