//! Recovery Playbook
//!
//! Decides what the auto-heal loop should do for one worker given its
//! current verdict and recovery bookkeeping.

use crate::domain::{Verdict, VerdictCause};
use crate::supervisor::recovery::{WorkerRecovery, WorkerTarget};
use chrono::{DateTime, Utc};
use std::fmt;

/// Action chosen for one worker in one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealAction {
    /// Healthy, nothing to do
    None,
    /// Degraded; watch but do not restart
    Monitor,
    Restart { reason: String },
    /// Restart budget spent; wait it out
    Quarantine { until: DateTime<Utc> },
    /// Raise the global stop (subject to manual override)
    Escalate { reason: String },
    /// Halted or stopped by an operator
    Hold { reason: String },
}

impl HealAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealAction::None => "none",
            HealAction::Monitor => "monitor",
            HealAction::Restart { .. } => "restart",
            HealAction::Quarantine { .. } => "quarantine",
            HealAction::Escalate { .. } => "escalate",
            HealAction::Hold { .. } => "hold",
        }
    }
}

impl fmt::Display for HealAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealAction::Restart { reason }
            | HealAction::Escalate { reason }
            | HealAction::Hold { reason } => write!(f, "{}: {}", self.as_str(), reason),
            HealAction::Quarantine { until } => {
                write!(f, "quarantine until {}", until.to_rfc3339())
            }
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

/// Recovery playbook with predefined responses
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlaybook;

impl RecoveryPlaybook {
    pub fn new() -> Self {
        Self
    }

    pub fn decide(
        &self,
        verdict: Verdict,
        cause: Option<&VerdictCause>,
        recovery: &WorkerRecovery,
        now: DateTime<Utc>,
    ) -> HealAction {
        if recovery.halted {
            return HealAction::Hold {
                reason: "halted pending operator intervention".to_string(),
            };
        }
        if recovery.target == WorkerTarget::Stopped {
            return HealAction::Hold {
                reason: "stopped by operator".to_string(),
            };
        }
        if verdict.is_ok() {
            return HealAction::None;
        }
        if recovery.pending_escalation {
            let reason = if recovery.exhausted_windows > 0 {
                format!(
                    "restart budget exhausted in {} consecutive windows",
                    recovery.exhausted_windows
                )
            } else {
                format!(
                    "{} consecutive failed recoveries",
                    recovery.consecutive_failures
                )
            };
            return HealAction::Escalate { reason };
        }
        self.remedy(verdict, cause, recovery, now)
    }

    /// Local remedy for an unhealthy worker, ignoring any pending escalation
    pub fn remedy(
        &self,
        verdict: Verdict,
        cause: Option<&VerdictCause>,
        recovery: &WorkerRecovery,
        now: DateTime<Utc>,
    ) -> HealAction {
        if verdict.is_ok() {
            return HealAction::None;
        }
        if let Some(until) = recovery.quarantined_until.filter(|u| now < *u) {
            return HealAction::Quarantine { until };
        }

        match verdict {
            Verdict::Degraded => HealAction::Monitor,
            _ => HealAction::Restart {
                reason: cause
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "failed".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn fresh() -> WorkerRecovery {
        WorkerRecovery::new(600, now())
    }

    #[test]
    fn test_verdict_mapping() {
        let playbook = RecoveryPlaybook::new();
        let recovery = fresh();
        assert_eq!(playbook.decide(Verdict::Ok, None, &recovery, now()), HealAction::None);
        assert_eq!(
            playbook.decide(Verdict::Degraded, None, &recovery, now()),
            HealAction::Monitor
        );

        let cause = VerdictCause::Stale {
            age_seconds: 25.0,
            ttl_seconds: 10,
        };
        let action = playbook.decide(Verdict::Failed, Some(&cause), &recovery, now());
        assert_eq!(
            action,
            HealAction::Restart {
                reason: "stale (age 25.0s > ttl 10s)".into()
            }
        );
    }

    #[test]
    fn test_quarantine_then_restart() {
        let playbook = RecoveryPlaybook::new();
        let mut recovery = fresh();
        let until = now() + Duration::seconds(300);
        recovery.quarantined_until = Some(until);

        assert_eq!(
            playbook.decide(Verdict::Failed, None, &recovery, now()),
            HealAction::Quarantine { until }
        );
        assert_eq!(
            playbook.decide(Verdict::Failed, None, &recovery, until).as_str(),
            "restart"
        );
    }

    #[test]
    fn test_hold_and_escalate_precedence() {
        let playbook = RecoveryPlaybook::new();
        let mut recovery = fresh();
        recovery.pending_escalation = true;
        recovery.consecutive_failures = 3;
        assert_eq!(
            playbook.decide(Verdict::Failed, None, &recovery, now()).as_str(),
            "escalate"
        );
        // Recovered on its own: nothing to escalate
        assert_eq!(playbook.decide(Verdict::Ok, None, &recovery, now()), HealAction::None);

        recovery.halted = true;
        assert_eq!(playbook.decide(Verdict::Failed, None, &recovery, now()).as_str(), "hold");

        let mut stopped = fresh();
        stopped.target = WorkerTarget::Stopped;
        assert_eq!(playbook.decide(Verdict::Failed, None, &stopped, now()).as_str(), "hold");
    }
}
