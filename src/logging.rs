//! Logging setup and rate-limited error reporting

use crate::config::LoggingConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize logging for long-running processes (console + daily file)
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warden=debug", config.level)));

    let log_dir = std::env::var("WARDEN_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "logs".to_string());

    // `tracing_appender::rolling::daily` panics if it cannot create the first
    // file, so writability is checked up front.
    let file_layer = match preflight_log_dir(&log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, "warden.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Keep the guard alive for the life of the process
            Box::leak(Box::new(guard));

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        Err(e) => {
            eprintln!(
                "Warning: log directory {} is not writable ({}), file logging disabled",
                log_dir, e
            );
            None
        }
    };

    let (console_plain, console_json) = if config.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(console_plain)
        .with(console_json)
        .with(file_layer)
        .try_init();

    if result.is_ok() && file_logging_enabled {
        info!("File logging enabled: {}/warden.log", log_dir);
    }
}

/// Minimal logging for one-shot CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .try_init();
}

fn preflight_log_dir(log_dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let marker = std::path::Path::new(log_dir).join(".warden_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)?;
    let _ = std::fs::remove_file(&marker);
    Ok(())
}

/// Per-key state of the error throttle
#[derive(Debug)]
struct ThrottleWindow {
    started: Instant,
    emitted: u32,
    suppressed: u64,
}

/// Bounds how often the same error is logged.
///
/// At most `max_per_window` occurrences of a key are emitted per rolling
/// window. When a new window opens, the first emitted occurrence carries the
/// number suppressed in the previous one.
#[derive(Debug)]
pub struct ErrorThrottle {
    window: Duration,
    max_per_window: u32,
    state: Mutex<HashMap<String, ThrottleWindow>>,
}

impl ErrorThrottle {
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window: max_per_window.max(1),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// One occurrence per 30s per key
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(30), 1)
    }

    /// `Some(suppressed_before)` if this occurrence should be logged
    pub fn permit(&self, key: &str) -> Option<u64> {
        self.permit_at(key, Instant::now())
    }

    pub fn permit_at(&self, key: &str, now: Instant) -> Option<u64> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Forget keys idle for many windows
        let horizon = self.window * 20;
        state.retain(|_, w| now.saturating_duration_since(w.started) < horizon);

        let entry = state.entry(key.to_string()).or_insert(ThrottleWindow {
            started: now,
            emitted: 0,
            suppressed: 0,
        });

        if now.saturating_duration_since(entry.started) >= self.window {
            let carried = entry.suppressed;
            entry.started = now;
            entry.emitted = 1;
            entry.suppressed = 0;
            return Some(carried);
        }

        if entry.emitted < self.max_per_window {
            entry.emitted += 1;
            Some(0)
        } else {
            entry.suppressed += 1;
            None
        }
    }

    /// Occurrences swallowed so far in the current window of `key`
    pub fn suppressed(&self, key: &str) -> u64 {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.get(key).map(|w| w.suppressed).unwrap_or(0)
    }
}

impl Default for ErrorThrottle {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_limits_per_window() {
        let throttle = ErrorThrottle::new(Duration::from_secs(30), 2);
        let t0 = Instant::now();

        assert_eq!(throttle.permit_at("store", t0), Some(0));
        assert_eq!(throttle.permit_at("store", t0), Some(0));
        assert_eq!(throttle.permit_at("store", t0), None);
        assert_eq!(throttle.permit_at("store", t0), None);
        assert_eq!(throttle.suppressed("store"), 2);

        // Independent keys are not affected
        assert_eq!(throttle.permit_at("breaker", t0), Some(0));

        // New window reports what was swallowed
        let t1 = t0 + Duration::from_secs(31);
        assert_eq!(throttle.permit_at("store", t1), Some(2));
        assert_eq!(throttle.permit_at("store", t1), Some(0));
        assert_eq!(throttle.permit_at("store", t1), None);
    }

    #[test]
    fn test_idle_keys_are_forgotten() {
        let throttle = ErrorThrottle::new(Duration::from_secs(1), 1);
        let t0 = Instant::now();
        assert_eq!(throttle.permit_at("a", t0), Some(0));
        assert_eq!(throttle.permit_at("a", t0), None);

        let later = t0 + Duration::from_secs(60);
        assert_eq!(throttle.permit_at("b", later), Some(0));
        // "a" was dropped, so its suppressed count is gone too
        assert_eq!(throttle.permit_at("a", later), Some(0));
    }
}
