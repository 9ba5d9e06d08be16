//! Clock collaborator — wall time and timers.
//!
//! The orchestrator never calls `tokio::time` or `SystemTime` directly, so
//! soak periods and health timeouts can be driven by a paused tokio runtime
//! in tests.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Boxed sleep future returned by [`Clock::sleep`].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Source of time for soak windows, readiness timeouts and timestamps.
pub trait Clock: Send + Sync {
    /// Current wall time as unix seconds.
    fn now_epoch_secs(&self) -> u64;

    /// Resolve after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// Clock backed by the tokio timer wheel and the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now_epoch_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_after_2020() {
        assert!(TokioClock.now_epoch_secs() > 1_577_836_800);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_follows_paused_time() {
        let start = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_secs(300)).await;
        assert!(start.elapsed() >= Duration::from_secs(300));
    }
}
