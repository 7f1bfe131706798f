//! Periodic loop runner shared by every long-running service.
//!
//! Each iteration runs one task cycle. Unexpected errors back off
//! exponentially up to a cap; one clean cycle resets the backoff. Shutdown is
//! checked before every cycle and after every sleep.

use crate::coordination::ShutdownToken;
use crate::error::Result;
use crate::logging::ErrorThrottle;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// One unit of periodic work
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run_once(&self) -> Result<()>;
}

/// Timing for a periodic loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    /// Delay before the next cycle after `consecutive_errors` failures in a row
    pub fn next_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return self.interval;
        }
        let factor = 2u32.saturating_pow(consecutive_errors - 1);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Loop outcome counters, returned when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub errors: u64,
}

/// Run `task` until shutdown is requested
pub async fn run_periodic<T>(task: Arc<T>, schedule: Schedule, mut shutdown: ShutdownToken) -> LoopStats
where
    T: PeriodicTask + ?Sized,
{
    let throttle = ErrorThrottle::with_defaults();
    let mut stats = LoopStats::default();
    let mut consecutive_errors: u32 = 0;

    info!(
        task = task.name(),
        interval_ms = schedule.interval.as_millis() as u64,
        "loop started"
    );

    while !shutdown.is_shutdown_requested() {
        stats.cycles += 1;
        match task.run_once().await {
            Ok(()) => {
                if consecutive_errors > 0 {
                    info!(task = task.name(), after = consecutive_errors, "loop recovered");
                }
                consecutive_errors = 0;
            }
            Err(e) => {
                stats.errors += 1;
                consecutive_errors = consecutive_errors.saturating_add(1);
                if let Some(suppressed) = throttle.permit(task.name()) {
                    error!(
                        task = task.name(),
                        error = %e,
                        consecutive = consecutive_errors,
                        suppressed,
                        "loop iteration failed"
                    );
                }
            }
        }

        let delay = schedule.next_delay(consecutive_errors);
        debug!(task = task.name(), delay_ms = delay.as_millis() as u64, "sleeping");
        if !shutdown.sleep(delay).await {
            break;
        }
    }

    info!(task = task.name(), cycles = stats.cycles, errors = stats.errors, "loop stopped");
    stats
}
