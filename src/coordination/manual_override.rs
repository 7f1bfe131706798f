//! Manual Override
//!
//! A time-boxed operator exemption. While an unexpired override is active
//! the auto-heal supervisor may not raise the global stop flag; every stop it
//! would have raised is still recorded as a `would_block_stop` event.

use crate::domain::{AuditEvent, ManualOverride, SharedClock};
use crate::error::{Result, WardenError};
use crate::persistence::{keys, DurableStore};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

/// Configuration for manual overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideConfig {
    /// Override lifetime when none is given (default: 600s)
    pub default_ttl_secs: u64,
    /// Longest lifetime an operator may request (default: 86400s)
    pub max_ttl_secs: u64,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 600,
            max_ttl_secs: 86_400,
        }
    }
}

/// Whether auto-heal may raise the global stop, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopPermission {
    pub allowed: bool,
    pub reason: String,
}

/// Operator-facing view of the override
#[derive(Debug, Clone, Serialize)]
pub struct OverrideStatus {
    pub effective: bool,
    pub remaining_secs: i64,
    #[serde(flatten)]
    pub record: ManualOverride,
}

#[derive(Debug, Clone)]
pub struct OverrideManager {
    config: OverrideConfig,
    store: DurableStore,
    clock: SharedClock,
}

impl OverrideManager {
    pub fn new(config: OverrideConfig, store: DurableStore, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Stored record; unreadable records count as no override
    pub async fn current(&self) -> ManualOverride {
        self.store
            .read_json_or(keys::MANUAL_OVERRIDE, ManualOverride::default())
            .await
    }

    pub async fn status(&self) -> OverrideStatus {
        let record = self.current().await;
        let now = self.clock.now();
        OverrideStatus {
            effective: record.is_effective(now),
            remaining_secs: record.remaining_secs(now),
            record,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.current().await.is_effective(self.clock.now())
    }

    /// Start an override lasting `ttl_secs` (or the configured default)
    pub async fn activate(
        &self,
        started_by: &str,
        ttl_secs: Option<u64>,
        reason: Option<String>,
    ) -> Result<ManualOverride> {
        let ttl = self.clamp_ttl(ttl_secs.unwrap_or(self.config.default_ttl_secs))?;
        let now = self.clock.now();
        let record = ManualOverride {
            active: true,
            started_by: Some(started_by.to_string()),
            started_at: Some(now),
            expires_at: Some(now + Duration::seconds(ttl as i64)),
            reason,
        };
        self.store.write_json(keys::MANUAL_OVERRIDE, &record).await?;
        info!(by = started_by, ttl_secs = ttl, "manual override activated");
        self.audit("override_activated", started_by, json!({ "ttl_secs": ttl }))
            .await;
        Ok(record)
    }

    /// End the override. Returns whether one was in effect.
    pub async fn deactivate(&self, by: &str) -> Result<bool> {
        let previous = self.current().await;
        let was_effective = previous.is_effective(self.clock.now());
        let record = ManualOverride {
            active: false,
            ..previous
        };
        self.store.write_json(keys::MANUAL_OVERRIDE, &record).await?;
        info!(by, was_effective, "manual override deactivated");
        self.audit("override_deactivated", by, json!({ "was_effective": was_effective }))
            .await;
        Ok(was_effective)
    }

    /// Push the expiry of an effective override further out
    pub async fn extend(&self, by: &str, extra_secs: u64) -> Result<ManualOverride> {
        let now = self.clock.now();
        let mut record = self.current().await;
        if !record.is_effective(now) {
            return Err(WardenError::Validation(
                "no active manual override to extend".to_string(),
            ));
        }
        let expires_at = record.expires_at.unwrap_or(now) + Duration::seconds(extra_secs as i64);
        let remaining = (expires_at - now).num_seconds().max(0) as u64;
        self.clamp_ttl(remaining)?;
        record.expires_at = Some(expires_at);

        self.store.write_json(keys::MANUAL_OVERRIDE, &record).await?;
        info!(by, extra_secs, "manual override extended");
        self.audit("override_extended", by, json!({ "extra_secs": extra_secs }))
            .await;
        Ok(record)
    }

    /// False while an unexpired override is active
    pub async fn can_autoheal_force_stop(&self) -> StopPermission {
        let record = self.current().await;
        let now = self.clock.now();
        if record.is_effective(now) {
            StopPermission {
                allowed: false,
                reason: format!(
                    "manual override by {} active for {}s more",
                    record.started_by.as_deref().unwrap_or("unknown"),
                    record.remaining_secs(now)
                ),
            }
        } else {
            StopPermission {
                allowed: true,
                reason: "no active manual override".to_string(),
            }
        }
    }

    /// Record a stop the supervisor wanted to raise but was not allowed to
    pub async fn record_suppressed_stop(&self, worker: &str, wanted_because: &str, blocked_because: &str) -> Result<()> {
        warn!(
            worker,
            wanted_because, blocked_because, "auto-heal stop suppressed by manual override"
        );
        let event = AuditEvent::new(self.clock.now(), "autoheal", "would_block_stop")
            .subject(worker)
            .reason(blocked_because)
            .detail(json!({ "escalation_reason": wanted_because }));
        self.store.append_json(keys::AUTOHEAL_EVENTS, &event).await
    }

    fn clamp_ttl(&self, ttl: u64) -> Result<u64> {
        if ttl == 0 {
            return Err(WardenError::Validation("override ttl must be positive".to_string()));
        }
        if ttl > self.config.max_ttl_secs {
            return Err(WardenError::Validation(format!(
                "override ttl {}s exceeds maximum {}s",
                ttl, self.config.max_ttl_secs
            )));
        }
        Ok(ttl)
    }

    async fn audit(&self, event: &str, by: &str, detail: serde_json::Value) {
        let entry = AuditEvent::new(self.clock.now(), by, event).detail(detail);
        if let Err(e) = self.store.append_json(keys::CONTROL_EVENTS, &entry).await {
            warn!(error = %e, event, "failed to append override audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use std::sync::Arc;

    fn manager() -> (tempfile::TempDir, DurableStore, Arc<ManualClock>, OverrideManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let manager = OverrideManager::new(OverrideConfig::default(), store.clone(), clock.clone());
        (dir, store, clock, manager)
    }

    #[tokio::test]
    async fn test_no_override_allows_stop() {
        let (_dir, _store, _clock, manager) = manager();
        assert!(manager.can_autoheal_force_stop().await.allowed);
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn test_active_override_blocks_until_expiry() {
        let (_dir, _store, clock, manager) = manager();
        manager.activate("cli", Some(120), None).await.unwrap();

        let permission = manager.can_autoheal_force_stop().await;
        assert!(!permission.allowed);
        assert!(permission.reason.contains("cli"));

        clock.advance_secs(119);
        assert!(!manager.can_autoheal_force_stop().await.allowed);
        clock.advance_secs(1);
        assert!(manager.can_autoheal_force_stop().await.allowed);
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let (_dir, _store, clock, manager) = manager();
        manager.activate("ui", None, Some("deploy".into())).await.unwrap();
        assert_eq!(manager.status().await.remaining_secs, 600);
        clock.advance_secs(600);
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn test_extend_and_deactivate() {
        let (_dir, _store, clock, manager) = manager();
        assert!(manager.extend("cli", 60).await.is_err());

        manager.activate("api", Some(60), None).await.unwrap();
        manager.extend("api", 120).await.unwrap();
        clock.advance_secs(100);
        assert!(manager.is_active().await);
        assert_eq!(manager.status().await.remaining_secs, 80);

        assert!(manager.deactivate("api").await.unwrap());
        assert!(!manager.is_active().await);
        assert!(!manager.deactivate("api").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_bounds() {
        let (_dir, _store, _clock, manager) = manager();
        assert!(manager.activate("cli", Some(0), None).await.is_err());
        assert!(manager.activate("cli", Some(86_401), None).await.is_err());
    }

    #[tokio::test]
    async fn test_suppressed_stop_is_recorded() {
        let (_dir, store, _clock, manager) = manager();
        manager
            .record_suppressed_stop("feeder", "3 consecutive failures", "override active")
            .await
            .unwrap();
        let events: Vec<AuditEvent> = store.read_log(keys::AUTOHEAL_EVENTS).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "would_block_stop");
        assert_eq!(events[0].subject.as_deref(), Some("feeder"));
    }
}
