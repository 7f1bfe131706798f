//! Control Plane
//!
//! The single authoritative "automated actions enabled" switch, plus the
//! global failsafe stop flag. Every automated actor asks [`ControlPlane::is_enabled`]
//! before acting and records the returned reason if it is refused.

use crate::coordination::circuit_breaker::{BreakerState, CircuitState};
use crate::domain::{AuditEvent, ControlDecision, ControlPlaneState, ControlReason, SharedClock};
use crate::error::{Result, WardenError};
use crate::persistence::{keys, DurableStore};
use serde_json::json;
use tracing::{error, info, warn};

/// Contents of the stop flag file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopFlag {
    pub raised_by: String,
    pub reason: String,
    pub raised_at: String,
}

impl StopFlag {
    fn render(&self) -> String {
        format!(
            "EMERGENCY STOP\nraised_by: {}\nreason: {}\nraised_at: {}\n\nManual intervention required. Clear with `warden stop-flag clear`.\n",
            self.raised_by, self.reason, self.raised_at
        )
    }

    fn parse(text: &str) -> Self {
        let field = |name: &str| {
            text.lines()
                .find_map(|l| l.strip_prefix(name).map(|v| v.trim().to_string()))
                .unwrap_or_else(|| "unknown".to_string())
        };
        Self {
            raised_by: field("raised_by:"),
            reason: field("reason:"),
            raised_at: field("raised_at:"),
        }
    }
}

/// Store-backed control plane
#[derive(Debug, Clone)]
pub struct ControlPlane {
    store: DurableStore,
    clock: SharedClock,
}

impl ControlPlane {
    pub fn new(store: DurableStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Current state. A missing record means automation was never enabled;
    /// an unreadable one falls back to disabled.
    pub async fn get_state(&self) -> ControlPlaneState {
        match self.store.read_json::<ControlPlaneState>(keys::CONTROL).await {
            Ok(state) => state,
            Err(WardenError::NotFound(_)) => {
                ControlPlaneState::disabled(ControlReason::Initial, self.clock.now())
            }
            Err(e) => {
                if let Some(suppressed) = self.store.read_error_permit("control_plane", keys::CONTROL) {
                    error!(
                        error = %e,
                        suppressed,
                        "control plane state unreadable, treating automation as disabled"
                    );
                }
                ControlPlaneState::disabled(ControlReason::ErrorFallback, self.clock.now())
            }
        }
    }

    /// Overwrite the switch. The only mutation point for the flag.
    pub async fn set_state(
        &self,
        enabled: bool,
        reason: ControlReason,
        note: Option<String>,
        changed_by: &str,
    ) -> Result<ControlPlaneState> {
        let state = ControlPlaneState {
            automated_actions_enabled: enabled,
            reason,
            note: note.clone(),
            changed_by: Some(changed_by.to_string()),
            since: self.clock.now(),
        };
        self.store.write_json(keys::CONTROL, &state).await?;

        info!(
            enabled,
            reason = %reason,
            by = changed_by,
            "control plane updated"
        );
        self.audit(
            AuditEvent::new(state.since, changed_by, "control_set")
                .reason(reason.as_str())
                .detail(json!({ "enabled": enabled, "note": note })),
        )
        .await;
        Ok(state)
    }

    /// May automated actions proceed? The stop flag always wins.
    pub async fn is_enabled(&self) -> ControlDecision {
        if self.stop_flag_raised().await {
            return ControlDecision::deny(ControlReason::EmergencyStop.as_str());
        }
        let state = self.get_state().await;
        if state.automated_actions_enabled {
            ControlDecision::allow(state.reason.as_str())
        } else {
            ControlDecision::deny(state.reason.as_str())
        }
    }

    /// Gate for order placement: automation must be enabled and the breaker closed
    pub async fn trading_gate(&self) -> ControlDecision {
        let decision = self.is_enabled().await;
        if !decision.enabled {
            return decision;
        }
        match self.store.read_json::<BreakerState>(keys::BREAKER).await {
            Ok(breaker) if breaker.state == CircuitState::Closed => decision,
            Ok(breaker) => ControlDecision::deny(format!(
                "circuit_breaker_{}: {}",
                breaker.state.as_str().to_ascii_lowercase(),
                breaker.reason.unwrap_or_default()
            )),
            Err(WardenError::NotFound(_)) => decision,
            Err(e) => {
                warn!(error = %e, "breaker state unreadable, refusing trading");
                ControlDecision::deny("circuit_breaker_unknown")
            }
        }
    }

    /// Record a blocked action in the control audit log
    pub async fn record_blocked(&self, actor: &str, action: &str, reason: &str) {
        self.audit(
            AuditEvent::new(self.clock.now(), actor, ControlReason::BlockedByControl.as_str())
                .subject(action)
                .reason(reason),
        )
        .await;
    }

    /// Breaker transition notice
    pub async fn notify_breaker(&self, breaker: &BreakerState, previous: CircuitState) {
        let level_open = breaker.state != CircuitState::Closed;
        if level_open {
            warn!(
                from = %previous,
                to = %breaker.state,
                reason = breaker.reason.as_deref().unwrap_or(""),
                "circuit breaker not closed, trading gate shut"
            );
        } else {
            info!(from = %previous, "circuit breaker closed, trading gate open");
        }
        self.audit(
            AuditEvent::new(self.clock.now(), "circuit_breaker", "breaker_transition")
                .reason(breaker.reason.clone().unwrap_or_default())
                .detail(json!({
                    "from": previous.as_str(),
                    "to": breaker.state.as_str(),
                    "trigger_count": breaker.trigger_count,
                    "active_conditions": breaker.active_conditions,
                })),
        )
        .await;
    }

    /// Operator emergency stop: raise the flag and disable automation
    pub async fn emergency_stop(&self, by: &str, reason: &str) -> Result<()> {
        self.raise_stop(by, reason).await?;
        self.set_state(false, ControlReason::EmergencyStop, Some(reason.to_string()), by)
            .await?;
        Ok(())
    }

    /// Write the global failsafe stop flag
    pub async fn raise_stop(&self, by: &str, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let flag = StopFlag {
            raised_by: by.to_string(),
            reason: reason.to_string(),
            raised_at: now.to_rfc3339(),
        };
        self.store.write_text(keys::STOP_FLAG, &flag.render()).await?;
        error!(by, reason, "global stop flag raised");
        self.audit(AuditEvent::new(now, by, "stop_raised").reason(reason)).await;
        Ok(())
    }

    pub async fn stop_flag_raised(&self) -> bool {
        self.store.exists(keys::STOP_FLAG).await
    }

    pub async fn stop_flag(&self) -> Option<StopFlag> {
        self.store
            .read_text(keys::STOP_FLAG)
            .await
            .ok()
            .map(|text| StopFlag::parse(&text))
    }

    /// Deliberate operator removal of the stop flag. Returns whether a flag was present.
    pub async fn clear_stop(&self, operator: &str) -> Result<bool> {
        let previous = self.stop_flag().await;
        let removed = self.store.remove(keys::STOP_FLAG).await?;
        if removed {
            warn!(operator, "global stop flag cleared");
            self.audit(
                AuditEvent::new(self.clock.now(), operator, "stop_cleared").detail(json!({
                    "previous_reason": previous.as_ref().map(|f| f.reason.clone()),
                    "previous_raised_by": previous.as_ref().map(|f| f.raised_by.clone()),
                })),
            )
            .await;
        }
        Ok(removed)
    }

    /// Control audit trail, oldest first
    pub async fn events(&self) -> Result<Vec<AuditEvent>> {
        self.store.read_log(keys::CONTROL_EVENTS).await
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.store.append_json(keys::CONTROL_EVENTS, &event).await {
            warn!(error = %e, event = %event.event, "failed to append control audit event");
        }
    }
}
