//! Alert Manager
//!
//! Routes alerts by severity to the log and the persistent alert log.
//! Includes rate limiting to prevent alert storms.

use crate::domain::SharedClock;
use crate::persistence::{keys, DurableStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational - log only unless configured
    Info,
    /// Warning - persisted
    Warning,
    /// Error - persisted
    Error,
    /// Critical - persisted, operator action required
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    /// Identical alerts swallowed by the rate limiter since the last one sent
    #[serde(default)]
    pub suppressed_before: u32,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            metadata: None,
            timestamp: Utc::now(),
            suppressed_before: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Configuration for alert manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    /// Minimum interval between duplicate alerts (default: 60s)
    pub rate_limit_secs: u64,
    /// Whether to persist info level alerts (default: false)
    pub persist_info: bool,
    /// Maximum persisted alerts per minute before throttling (default: 10)
    pub max_alerts_per_minute: u32,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            persist_info: false,
            max_alerts_per_minute: 10,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

/// Alert Manager for coordinating notifications
pub struct AlertManager {
    config: AlertManagerConfig,
    store: DurableStore,
    clock: SharedClock,
    rate_limits: Arc<RwLock<HashMap<String, RateLimitState>>>,
    alerts_this_minute: Arc<RwLock<Vec<DateTime<Utc>>>>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig, store: DurableStore, clock: SharedClock) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            store,
            clock,
            rate_limits: Arc::new(RwLock::new(HashMap::new())),
            alerts_this_minute: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    pub fn with_defaults(store: DurableStore, clock: SharedClock) -> Self {
        Self::new(AlertManagerConfig::default(), store, clock)
    }

    /// Subscribe to alerts
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.component, alert.level, alert.title)
    }

    /// `Some(suppressed)` when the alert may go out, `None` when rate limited
    async fn rate_limit(&self, alert: &Alert) -> Option<u32> {
        let key = Self::rate_limit_key(alert);
        let now = self.clock.now();

        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds();
            if elapsed < self.config.rate_limit_secs as i64 {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.title, state.suppressed_count
                );
                return None;
            }

            let suppressed = state.suppressed_count;
            state.last_sent = now;
            state.suppressed_count = 0;
            Some(suppressed)
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
            Some(0)
        }
    }

    /// Global throttle (alerts per minute)
    async fn is_throttled(&self) -> bool {
        let now = self.clock.now();
        let minute_ago = now - chrono::Duration::minutes(1);

        let mut alerts = self.alerts_this_minute.write().await;
        alerts.retain(|t| *t > minute_ago);

        if alerts.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                "Alert throttling: {} alerts in last minute (max: {})",
                alerts.len(),
                self.config.max_alerts_per_minute
            );
            return true;
        }

        alerts.push(now);
        false
    }

    /// Send an alert. Returns whether it was persisted.
    pub async fn alert(&self, mut alert: Alert) -> bool {
        alert.timestamp = self.clock.now();
        let _ = self.event_tx.send(alert.clone());

        match alert.level {
            AlertLevel::Info => info!("[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error => {
                error!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Critical => {
                error!(
                    "CRITICAL [{}] {}: {}",
                    alert.component, alert.title, alert.message
                )
            }
        }

        let should_persist = match alert.level {
            AlertLevel::Info => self.config.persist_info,
            AlertLevel::Warning | AlertLevel::Error | AlertLevel::Critical => true,
        };
        if !should_persist {
            return false;
        }

        let Some(suppressed) = self.rate_limit(&alert).await else {
            return false;
        };
        if self.is_throttled().await {
            return false;
        }
        alert.suppressed_before = suppressed;

        if let Err(e) = self.store.append_json(keys::ALERTS, &alert).await {
            error!("Failed to persist alert: {}", e);
            return false;
        }
        true
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) -> bool {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await
    }

    pub async fn warning(&self, component: &str, title: &str, message: &str) -> bool {
        self.alert(Alert::new(AlertLevel::Warning, component, title, message))
            .await
    }

    pub async fn error(&self, component: &str, title: &str, message: &str) -> bool {
        self.alert(Alert::new(AlertLevel::Error, component, title, message))
            .await
    }

    pub async fn critical(&self, component: &str, title: &str, message: &str) -> bool {
        self.alert(Alert::new(AlertLevel::Critical, component, title, message))
            .await
    }

    /// Breaker opened
    pub async fn circuit_breaker_tripped(&self, reason: &str) -> bool {
        self.alert(
            Alert::new(
                AlertLevel::Error,
                "circuit_breaker",
                "Circuit Breaker Tripped",
                reason,
            )
            .with_metadata(serde_json::json!({
                "action": "trading_paused",
                "reason": reason
            })),
        )
        .await
    }

    /// Worker failed and a restart is being attempted
    pub async fn component_failed(&self, component: &str, error: &str) -> bool {
        self.alert(
            Alert::new(AlertLevel::Error, component, "Component Failed", error).with_metadata(
                serde_json::json!({
                    "action": "restart_attempted",
                    "error": error
                }),
            ),
        )
        .await
    }

    /// Restart budget spent and the global stop raised
    pub async fn restart_exhausted(&self, component: &str, attempts: u32) -> bool {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                component,
                "Restart Attempts Exhausted",
                &format!(
                    "Component {} failed to recover after {} attempts",
                    component, attempts
                ),
            )
            .with_metadata(serde_json::json!({
                "action": "manual_intervention_required",
                "attempts": attempts
            })),
        )
        .await
    }

    /// Escalation wanted but a manual override is active
    pub async fn stop_suppressed(&self, component: &str, reason: &str) -> bool {
        self.alert(
            Alert::new(
                AlertLevel::Warning,
                component,
                "Global Stop Suppressed",
                &format!("auto-heal wanted to stop the system but was overridden: {reason}"),
            )
            .with_metadata(serde_json::json!({
                "action": "would_block_stop",
                "reason": reason
            })),
        )
        .await
    }

    /// Persisted alerts, oldest first
    pub async fn history(&self) -> crate::error::Result<Vec<Alert>> {
        self.store.read_log(keys::ALERTS).await
    }

    /// Keys with alerts currently being swallowed
    pub async fn get_suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }
}
