use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Source of wall-clock time for every component.
///
/// Components never call `Utc::now()` directly so that staleness, cooldowns
/// and breaker timeouts can be driven deterministically in tests.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as fractional UTC epoch seconds
    fn epoch_secs(&self) -> f64 {
        to_epoch_secs(self.now())
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

/// Manually advanced clock
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at a whole number of epoch seconds
    pub fn at_epoch(secs: i64) -> Self {
        let start = Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_default();
        Self::new(start)
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Epoch values above this are treated as milliseconds
pub const MILLIS_THRESHOLD: f64 = 1e12;

/// Normalize an epoch timestamp that may be expressed in milliseconds
pub fn normalize_epoch(ts: f64) -> f64 {
    if ts > MILLIS_THRESHOLD {
        ts / 1000.0
    } else {
        ts
    }
}

pub fn to_epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
}

/// Convert fractional epoch seconds (or milliseconds) into a UTC timestamp
pub fn from_epoch_secs(ts: f64) -> Option<DateTime<Utc>> {
    let ts = normalize_epoch(ts);
    if !ts.is_finite() || ts < 0.0 {
        return None;
    }
    let micros = (ts * 1_000_000.0).round() as i64;
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Seconds elapsed between two instants, as a float
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}
