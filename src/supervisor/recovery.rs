//! Per-worker recovery bookkeeping, persisted in `autoheal.json`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Auto-heal state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    #[default]
    Idle,
    Recovering,
    Succeeded,
    Failed,
    /// Control plane refused the attempt
    Blocked,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryState::Idle => "IDLE",
            RecoveryState::Recovering => "RECOVERING",
            RecoveryState::Succeeded => "SUCCEEDED",
            RecoveryState::Failed => "FAILED",
            RecoveryState::Blocked => "BLOCKED",
        }
    }

    pub fn can_transition_to(&self, target: RecoveryState) -> bool {
        use RecoveryState::*;
        matches!(
            (self, target),
            (Idle | Failed | Blocked | Succeeded, Recovering)
                | (Idle | Failed | Succeeded | Blocked, Blocked)
                | (Recovering, Succeeded | Failed)
                | (Succeeded, Idle)
                | (Blocked | Failed, Idle)
                // Budget refusal happens before any launch
                | (Idle | Failed | Blocked | Succeeded, Failed)
        )
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Desired run state set by operator commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTarget {
    #[default]
    Running,
    Stopped,
}

/// Bounded restart budget over a rolling window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryWindow {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub window_start: DateTime<Utc>,
    pub window_seconds: u64,
    /// The budget ran out in this window and it has been counted
    #[serde(default)]
    pub exhaustion_counted: bool,
}

impl RecoveryWindow {
    pub fn new(window_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            failures: 0,
            window_start: now,
            window_seconds,
            exhaustion_counted: false,
        }
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + Duration::seconds(self.window_seconds as i64)
    }

    /// Start a fresh window once the current one has elapsed. Returns whether it rolled.
    pub fn roll(&mut self, now: DateTime<Utc>) -> bool {
        if now >= self.window_end() {
            self.reset(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        *self = Self::new(self.window_seconds, now);
    }

    pub fn exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

/// Everything the supervisor tracks about one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecovery {
    pub state: RecoveryState,
    #[serde(default)]
    pub target: WorkerTarget,
    pub window: RecoveryWindow,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Windows in a row whose budget ran out without a full healthy window between
    #[serde(default)]
    pub exhausted_windows: u32,
    /// Escalated; no further recovery until an operator clears the stop flag
    #[serde(default)]
    pub halted: bool,
    /// Escalation wanted but an override was active when it came due
    #[serde(default)]
    pub pending_escalation: bool,
    /// A `would_block_stop` event has been logged for the pending escalation
    #[serde(default)]
    pub stop_suppressed: bool,
    #[serde(default)]
    pub quarantined_until: Option<DateTime<Utc>>,
    /// Start of the current uninterrupted OK streak
    #[serde(default)]
    pub healthy_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_action: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecovery {
    pub fn new(window_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            state: RecoveryState::Idle,
            target: WorkerTarget::Running,
            window: RecoveryWindow::new(window_seconds, now),
            consecutive_failures: 0,
            exhausted_windows: 0,
            halted: false,
            pending_escalation: false,
            stop_suppressed: false,
            quarantined_until: None,
            healthy_since: None,
            last_action: None,
            last_error: None,
            last_pid: None,
            updated_at: now,
        }
    }

    pub fn is_quarantined(&self, now: DateTime<Utc>) -> bool {
        self.quarantined_until.map_or(false, |until| now < until)
    }

    /// Move to `to`, ignoring illegal transitions. Returns whether it moved.
    pub fn transition(&mut self, to: RecoveryState, now: DateTime<Utc>) -> bool {
        if self.state == to {
            self.updated_at = now;
            return true;
        }
        if !self.state.can_transition_to(to) {
            return false;
        }
        self.state = to;
        self.updated_at = now;
        true
    }

    /// Track OK verdicts; a full window of continuous health resets the budget
    pub fn observe_health(&mut self, healthy: bool, now: DateTime<Utc>) -> bool {
        if !healthy {
            self.healthy_since = None;
            return false;
        }
        let since = *self.healthy_since.get_or_insert(now);
        let healthy_for = (now - since).num_seconds();
        if healthy_for >= self.window.window_seconds as i64
            && (self.window.attempts > 0 || self.exhausted_windows > 0)
        {
            self.window.reset(now);
            self.consecutive_failures = 0;
            self.exhausted_windows = 0;
            self.quarantined_until = None;
            return true;
        }
        false
    }
}

/// Contents of `autoheal.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoHealSnapshot {
    pub updated_at: DateTime<Utc>,
    pub enabled: bool,
    pub workers: BTreeMap<String, WorkerRecovery>,
}
