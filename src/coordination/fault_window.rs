use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Bounded rolling window of fault timestamps
#[derive(Debug, Clone)]
pub struct FaultWindow {
    window: Duration,
    capacity: usize,
    events: VecDeque<DateTime<Utc>>,
}

impl FaultWindow {
    pub fn new(window_secs: u64, capacity: usize) -> Self {
        Self {
            window: Duration::seconds(window_secs as i64),
            capacity: capacity.max(1),
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.record_many(at, 1);
    }

    pub fn record_many(&mut self, at: DateTime<Utc>, count: u64) {
        for _ in 0..count.min(self.capacity as u64) {
            self.events.push_back(at);
        }
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    /// Faults inside the window ending at `now`. Older entries are discarded.
    pub fn count(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Drop every fault recorded at or before `cutoff`
    pub fn discard_through(&mut self, cutoff: DateTime<Utc>) {
        self.events.retain(|ts| *ts > cutoff);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while matches!(self.events.front(), Some(ts) if *ts <= cutoff) {
            self.events.pop_front();
        }
    }
}

/// Turns monotonically increasing counters published by workers into
/// increments. A counter that goes backwards means the worker restarted and
/// its new value counts in full.
#[derive(Debug, Clone, Default)]
pub struct CounterTracker {
    last: HashMap<String, u64>,
}

impl CounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta(&mut self, key: &str, value: u64) -> u64 {
        match self.last.insert(key.to_string(), value) {
            None => 0,
            Some(prev) if value >= prev => value - prev,
            Some(_) => value,
        }
    }
}
