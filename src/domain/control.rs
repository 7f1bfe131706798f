use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason tag carried by every control-plane write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReason {
    /// No state has ever been written
    Initial,
    /// Operator flipped the switch
    UserToggle,
    /// Global stop flag raised or emergency stop requested
    EmergencyStop,
    /// An automated guard disabled automation
    SystemGuard,
    /// Recorded by an actor that was refused by the control plane
    BlockedByControl,
    /// Stored state could not be read
    ErrorFallback,
}

impl ControlReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlReason::Initial => "initial",
            ControlReason::UserToggle => "user_toggle",
            ControlReason::EmergencyStop => "emergency_stop",
            ControlReason::SystemGuard => "system_guard",
            ControlReason::BlockedByControl => "blocked_by_control",
            ControlReason::ErrorFallback => "error_fallback",
        }
    }
}

impl fmt::Display for ControlReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ControlReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initial" => Ok(ControlReason::Initial),
            "user_toggle" => Ok(ControlReason::UserToggle),
            "emergency_stop" => Ok(ControlReason::EmergencyStop),
            "system_guard" => Ok(ControlReason::SystemGuard),
            "blocked_by_control" => Ok(ControlReason::BlockedByControl),
            "error_fallback" => Ok(ControlReason::ErrorFallback),
            other => Err(format!("unknown control reason: {other}")),
        }
    }
}

/// The single authoritative automation switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneState {
    pub automated_actions_enabled: bool,
    pub reason: ControlReason,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub changed_by: Option<String>,
    pub since: DateTime<Utc>,
}

impl ControlPlaneState {
    /// Safest state: automation disabled
    pub fn disabled(reason: ControlReason, since: DateTime<Utc>) -> Self {
        Self {
            automated_actions_enabled: false,
            reason,
            note: None,
            changed_by: None,
            since,
        }
    }
}

/// Answer to "may I act?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlDecision {
    pub enabled: bool,
    pub reason: String,
}

impl ControlDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            enabled: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            enabled: false,
            reason: reason.into(),
        }
    }
}

/// Time-boxed operator exemption from the auto-heal stop escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManualOverride {
    pub active: bool,
    #[serde(default)]
    pub started_by: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ManualOverride {
    /// Active and not yet expired
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        match (self.active, self.expires_at) {
            (true, Some(expires_at)) => now < expires_at,
            _ => false,
        }
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        match self.expires_at {
            Some(expires_at) if self.is_effective(now) => (expires_at - now).num_seconds().max(0),
            _ => 0,
        }
    }
}

/// Single-instance lock record for one worker role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_name: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}
