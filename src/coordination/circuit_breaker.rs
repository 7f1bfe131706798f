//! Circuit Breaker
//!
//! Gates automated trading on aggregated health and fault counters.
//! CLOSED -> OPEN when a watched condition is active, OPEN -> HALF_OPEN after
//! the recovery timeout, HALF_OPEN -> CLOSED only when every condition is
//! clear (otherwise straight back to OPEN). State is persisted on every
//! change so a restart never silently re-enables trading.

use crate::coordination::control_plane::ControlPlane;
use crate::coordination::fault_window::{CounterTracker, FaultWindow};
use crate::domain::{SharedClock, SystemHealthSnapshot};
use crate::error::{Result, WardenError};
use crate::persistence::{keys, DurableStore};
use crate::supervisor::alert_manager::AlertManager;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Automation permitted
    Closed,
    /// Blocked
    Open,
    /// Probing whether the fault has cleared
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Transitions the evaluator may take. Only an operator reset leaves
    /// OPEN for CLOSED directly.
    pub fn can_transition_to(&self, target: CircuitState) -> bool {
        use CircuitState::*;
        matches!(
            (self, target),
            (Closed, Open) | (Open, HalfOpen) | (HalfOpen, Closed) | (HalfOpen, Open)
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Categories of fault the breaker can watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// The market-data feeder is missing or stale
    FeederStale,
    /// Any required component is not OK
    ComponentFailed,
    /// Order failures within the rolling window reached the threshold
    OrderFailures,
    /// Exchange errors within the rolling window reached the threshold
    ExchangeErrors,
    /// Realized loss for the day reached the limit
    DailyLossLimit,
    /// A component reported schema violations
    SchemaViolations,
    /// Operator trip
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::FeederStale => "feeder_stale",
            TriggerKind::ComponentFailed => "component_failed",
            TriggerKind::OrderFailures => "order_failures",
            TriggerKind::ExchangeErrors => "exchange_errors",
            TriggerKind::DailyLossLimit => "daily_loss_limit",
            TriggerKind::SchemaViolations => "schema_violations",
            TriggerKind::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One currently active trigger condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCondition {
    pub kind: TriggerKind,
    /// Stable tag stored in `active_conditions`
    pub tag: String,
    /// Human-readable description used in `reason`
    pub detail: String,
}

impl TriggerCondition {
    fn new(kind: TriggerKind, subject: Option<&str>, detail: String) -> Self {
        let tag = match subject {
            Some(s) => format!("{}:{}", kind.as_str(), s),
            None => kind.as_str().to_string(),
        };
        Self { kind, tag, detail }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Interval between evaluations (default: 5s)
    pub interval_secs: u64,
    /// Time OPEN before probing in HALF_OPEN (default: 60s)
    pub recovery_timeout_secs: u64,
    /// Failed half-open trials tolerated before waiting for auto-reset (default: 3)
    pub max_recovery_attempts: u32,
    /// Continuous OPEN time that forces a half-open trial regardless of attempts (default: 3600s)
    pub auto_reset_interval_secs: u64,
    /// Trigger categories that open the breaker
    pub watched: Vec<TriggerKind>,
    /// Component treated as the market-data feeder (default: "feeder")
    pub feeder_component: String,
    /// Order failures within the window that open the breaker (default: 5)
    pub order_failure_threshold: u32,
    /// Order failure window (default: 300s)
    pub order_failure_window_secs: u64,
    /// Exchange errors within the window that open the breaker (default: 3)
    pub exchange_error_threshold: u32,
    /// Exchange error window (default: 300s)
    pub exchange_error_window_secs: u64,
    /// Realized daily loss that opens the breaker (default: 1000)
    pub daily_loss_limit_usd: Decimal,
    /// Component publishing the realized PnL metric (default: "trader")
    pub pnl_component: String,
    /// Metric holding today's realized PnL (default: "realized_pnl_today")
    pub pnl_metric: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            recovery_timeout_secs: 60,
            max_recovery_attempts: 3,
            auto_reset_interval_secs: 3600,
            watched: vec![
                TriggerKind::FeederStale,
                TriggerKind::OrderFailures,
                TriggerKind::ExchangeErrors,
                TriggerKind::DailyLossLimit,
                TriggerKind::SchemaViolations,
                TriggerKind::Manual,
            ],
            feeder_component: "feeder".to_string(),
            order_failure_threshold: 5,
            order_failure_window_secs: 300,
            exchange_error_threshold: 3,
            exchange_error_window_secs: 300,
            daily_loss_limit_usd: dec!(1000),
            pnl_component: "trader".to_string(),
            pnl_metric: "realized_pnl_today".to_string(),
        }
    }
}

impl BreakerConfig {
    pub fn watches(&self, kind: TriggerKind) -> bool {
        kind == TriggerKind::Manual || self.watched.contains(&kind)
    }
}

/// Persisted breaker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: CircuitState,
    pub reason: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub recovery_attempts: u32,
    pub active_conditions: BTreeSet<String>,
    /// Set by an operator trip, cleared only by an operator reset
    #[serde(default)]
    pub manual_trip: Option<String>,
    /// Last operator reset. Every process holding fault windows drops the
    /// faults recorded before it.
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerState {
    pub fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            reason: None,
            opened_at: None,
            trigger_count: 0,
            recovery_attempts: 0,
            active_conditions: BTreeSet::new(),
            manual_trip: None,
            reset_at: None,
            updated_at: now,
        }
    }

    /// Move to `to` if the table allows it
    pub fn move_to(&mut self, to: CircuitState, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(%from, %to, "illegal breaker transition refused");
            return None;
        }
        self.state = to;
        self.updated_at = now;
        Some(Transition {
            from,
            to,
            auto_reset: false,
        })
    }
}

/// A state change produced by one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub auto_reset: bool,
}

/// Advance the state machine by one evaluation. Pure.
///
/// Every state change goes through [`BreakerState::move_to`], so only the
/// transitions in [`CircuitState::can_transition_to`] can happen here.
pub fn step(
    config: &BreakerConfig,
    st: &mut BreakerState,
    conditions: &[TriggerCondition],
    now: DateTime<Utc>,
) -> Option<Transition> {
    let tags: BTreeSet<String> = conditions.iter().map(|c| c.tag.clone()).collect();
    let reason = || {
        conditions
            .iter()
            .map(|c| c.detail.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    };

    match st.state {
        CircuitState::Closed => {
            if conditions.is_empty() {
                st.active_conditions.clear();
                return None;
            }
            let t = st.move_to(CircuitState::Open, now)?;
            st.reason = Some(reason());
            st.opened_at = Some(now);
            st.trigger_count += 1;
            st.recovery_attempts = 0;
            st.active_conditions = tags;
            Some(t)
        }
        CircuitState::Open => {
            let opened_at = *st.opened_at.get_or_insert(now);
            let elapsed = now - opened_at;
            if !conditions.is_empty() {
                st.active_conditions = tags;
            }

            if elapsed >= Duration::seconds(config.auto_reset_interval_secs as i64) {
                let t = st.move_to(CircuitState::HalfOpen, now)?;
                st.recovery_attempts = 0;
                return Some(Transition { auto_reset: true, ..t });
            }
            if elapsed >= Duration::seconds(config.recovery_timeout_secs as i64)
                && st.recovery_attempts < config.max_recovery_attempts
            {
                st.move_to(CircuitState::HalfOpen, now)
            } else {
                None
            }
        }
        CircuitState::HalfOpen => {
            if conditions.is_empty() {
                let t = st.move_to(CircuitState::Closed, now)?;
                st.reason = None;
                st.opened_at = None;
                st.recovery_attempts = 0;
                st.active_conditions.clear();
                Some(t)
            } else {
                let t = st.move_to(CircuitState::Open, now)?;
                st.reason = Some(reason());
                st.opened_at = Some(now);
                st.recovery_attempts += 1;
                st.active_conditions = tags;
                Some(t)
            }
        }
    }
}

#[derive(Debug)]
struct FaultCounters {
    order_failures: FaultWindow,
    exchange_errors: FaultWindow,
    counters: CounterTracker,
    /// Newest operator reset already applied to the windows
    reset_seen: Option<DateTime<Utc>>,
}

/// Monitoring view
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: BreakerState,
    pub order_failures_in_window: usize,
    pub exchange_errors_in_window: usize,
}

/// Store-backed circuit breaker
pub struct CircuitBreaker {
    config: BreakerConfig,
    store: DurableStore,
    clock: SharedClock,
    control: ControlPlane,
    alerts: Option<Arc<AlertManager>>,
    state: Mutex<BreakerState>,
    faults: Mutex<FaultCounters>,
}

impl CircuitBreaker {
    /// Create a breaker, restoring any persisted state
    pub async fn load(
        config: BreakerConfig,
        store: DurableStore,
        clock: SharedClock,
        control: ControlPlane,
    ) -> Self {
        let faults = FaultCounters {
            order_failures: FaultWindow::new(
                config.order_failure_window_secs,
                (config.order_failure_threshold as usize).max(1) * 4,
            ),
            exchange_errors: FaultWindow::new(
                config.exchange_error_window_secs,
                (config.exchange_error_threshold as usize).max(1) * 4,
            ),
            counters: CounterTracker::new(),
            reset_seen: None,
        };
        let breaker = Self {
            state: Mutex::new(BreakerState::closed(clock.now())),
            faults: Mutex::new(faults),
            config,
            store,
            clock,
            control,
            alerts: None,
        };
        let restored = breaker.reload().await;
        if restored.state != CircuitState::Closed {
            warn!(state = %restored.state, reason = ?restored.reason, "circuit breaker restored not closed");
        }
        breaker.set_cached(restored);
        breaker
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Last known state
    pub fn state(&self) -> BreakerState {
        match self.state.lock() {
            Ok(st) => st.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn record_order_failure(&self) {
        let now = self.clock.now();
        self.with_faults(|f| f.order_failures.record(now));
    }

    pub fn record_exchange_error(&self) {
        let now = self.clock.now();
        self.with_faults(|f| f.exchange_errors.record(now));
    }

    /// Active, watched trigger conditions for this snapshot
    pub fn conditions(&self, snapshot: &SystemHealthSnapshot, manual: Option<&str>) -> Vec<TriggerCondition> {
        let now = self.clock.now();
        let cfg = &self.config;
        let mut out = Vec::new();

        if let Some(reason) = manual {
            out.push(TriggerCondition::new(
                TriggerKind::Manual,
                None,
                format!("manual: {reason}"),
            ));
        }

        if cfg.watches(TriggerKind::FeederStale) {
            if let Some(cause) = snapshot.cause_of(&cfg.feeder_component) {
                if cause.is_freshness() {
                    out.push(TriggerCondition::new(
                        TriggerKind::FeederStale,
                        Some(&cfg.feeder_component),
                        format!("{} {}", cfg.feeder_component, cause),
                    ));
                }
            }
        }

        if cfg.watches(TriggerKind::ComponentFailed) {
            for name in &snapshot.failing_components {
                let cause = snapshot
                    .cause_of(name)
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "not ok".to_string());
                out.push(TriggerCondition::new(
                    TriggerKind::ComponentFailed,
                    Some(name),
                    format!("{name} {cause}"),
                ));
            }
        }

        let (order_failures, exchange_errors) = self.with_faults(|f| {
            for (name, record) in &snapshot.per_component {
                if let Some(total) = record.metric_f64("order_failures_total") {
                    let delta = f.counters.delta(&format!("{name}:orders"), total.max(0.0) as u64);
                    f.order_failures.record_many(now, delta);
                }
                if let Some(total) = record.metric_f64("exchange_errors_total") {
                    let delta = f.counters.delta(&format!("{name}:exchange"), total.max(0.0) as u64);
                    f.exchange_errors.record_many(now, delta);
                }
            }
            (f.order_failures.count(now), f.exchange_errors.count(now))
        });

        if cfg.watches(TriggerKind::OrderFailures)
            && cfg.order_failure_threshold > 0
            && order_failures >= cfg.order_failure_threshold as usize
        {
            out.push(TriggerCondition::new(
                TriggerKind::OrderFailures,
                None,
                format!(
                    "{} order failures in {}s",
                    order_failures, cfg.order_failure_window_secs
                ),
            ));
        }

        if cfg.watches(TriggerKind::ExchangeErrors)
            && cfg.exchange_error_threshold > 0
            && exchange_errors >= cfg.exchange_error_threshold as usize
        {
            out.push(TriggerCondition::new(
                TriggerKind::ExchangeErrors,
                None,
                format!(
                    "{} exchange errors in {}s",
                    exchange_errors, cfg.exchange_error_window_secs
                ),
            ));
        }

        if cfg.watches(TriggerKind::DailyLossLimit) {
            let pnl = snapshot
                .record(&cfg.pnl_component)
                .and_then(|r| r.metric_f64(&cfg.pnl_metric))
                .and_then(Decimal::from_f64);
            if let Some(pnl) = pnl {
                if pnl <= -cfg.daily_loss_limit_usd {
                    out.push(TriggerCondition::new(
                        TriggerKind::DailyLossLimit,
                        None,
                        format!(
                            "daily loss {} reached limit {}",
                            pnl.abs().round_dp(2),
                            cfg.daily_loss_limit_usd
                        ),
                    ));
                }
            }
        }

        if cfg.watches(TriggerKind::SchemaViolations) {
            let violations = snapshot.metric_sum("schema_violations");
            if violations > 0.0 {
                out.push(TriggerCondition::new(
                    TriggerKind::SchemaViolations,
                    None,
                    format!("{violations} schema violations"),
                ));
            }
        }

        out
    }

    /// Run one evaluation cycle against a health snapshot
    pub async fn evaluate(&self, snapshot: &SystemHealthSnapshot) -> Result<Option<Transition>> {
        let mut current = self.reload().await;
        let conditions = self.conditions(snapshot, current.manual_trip.as_deref());
        let now = self.clock.now();

        let before = current.clone();
        let transition = step(&self.config, &mut current, &conditions, now);

        if current != before {
            self.store.write_json(keys::BREAKER, &current).await?;
        }
        self.set_cached(current.clone());

        if let Some(t) = transition {
            self.announce(&current, t).await;
        } else {
            debug!(state = %current.state, conditions = conditions.len(), "breaker evaluated");
        }
        Ok(transition)
    }

    /// Operator trip. The manual condition stays active until [`reset`](Self::reset).
    pub async fn trip(&self, reason: &str, by: &str) -> Result<BreakerState> {
        let mut current = self.reload().await;
        let now = self.clock.now();
        current.manual_trip = Some(format!("{reason} (by {by})"));

        let condition = TriggerCondition::new(TriggerKind::Manual, None, format!("manual: {reason}"));
        let transition = match current.state {
            CircuitState::Open => {
                current.active_conditions.insert(condition.tag);
                current.updated_at = now;
                None
            }
            _ => {
                // A trip is a fresh trigger even mid-trial
                let t = current.move_to(CircuitState::Open, now);
                if t.is_some() {
                    current.reason = Some(condition.detail);
                    current.opened_at = Some(now);
                    current.trigger_count += 1;
                    current.recovery_attempts = 0;
                    current.active_conditions = BTreeSet::from([condition.tag]);
                }
                t
            }
        };

        self.store.write_json(keys::BREAKER, &current).await?;
        self.set_cached(current.clone());
        if let Some(t) = transition {
            self.announce(&current, t).await;
        }
        Ok(current)
    }

    /// Operator reset: force CLOSED and clear the manual condition and fault windows.
    /// The one transition allowed outside [`CircuitState::can_transition_to`].
    pub async fn reset(&self, by: &str) -> Result<BreakerState> {
        let previous = self.reload().await;
        let now = self.clock.now();
        let mut current = BreakerState::closed(now);
        current.trigger_count = previous.trigger_count;
        current.reset_at = Some(now);

        self.with_faults(|f| {
            f.order_failures.clear();
            f.exchange_errors.clear();
            f.reset_seen = Some(now);
        });
        self.store.write_json(keys::BREAKER, &current).await?;
        self.set_cached(current.clone());

        warn!(by, from = %previous.state, "circuit breaker force-closed");
        if previous.state != CircuitState::Closed {
            self.announce(
                &current,
                Transition {
                    from: previous.state,
                    to: CircuitState::Closed,
                    auto_reset: false,
                },
            )
            .await;
        }
        Ok(current)
    }

    pub fn get_stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let (orders, exchange) =
            self.with_faults(|f| (f.order_failures.count(now), f.exchange_errors.count(now)));
        CircuitBreakerStats {
            state: self.state(),
            order_failures_in_window: orders,
            exchange_errors_in_window: exchange,
        }
    }

    /// Persisted state is authoritative: an operator may have tripped or
    /// reset the breaker from another process.
    async fn reload(&self) -> BreakerState {
        match self.store.read_json::<BreakerState>(keys::BREAKER).await {
            Ok(st) => {
                if let Some(reset_at) = st.reset_at {
                    self.apply_reset(reset_at);
                }
                st
            }
            Err(WardenError::NotFound(_)) => self.state(),
            Err(e) => {
                if let Some(suppressed) = self.store.read_error_permit("breaker", keys::BREAKER) {
                    error!(error = %e, suppressed, "breaker state unreadable, holding breaker open");
                }
                let mut st = self.state();
                if st.state == CircuitState::Closed {
                    st.state = CircuitState::Open;
                    st.opened_at = Some(self.clock.now());
                    st.reason = Some("breaker state unreadable".to_string());
                }
                st
            }
        }
    }

    /// Forget faults that predate a reset issued by any process
    fn apply_reset(&self, reset_at: DateTime<Utc>) {
        self.with_faults(|f| {
            if f.reset_seen.map_or(true, |seen| reset_at > seen) {
                f.order_failures.discard_through(reset_at);
                f.exchange_errors.discard_through(reset_at);
                f.reset_seen = Some(reset_at);
                debug!(%reset_at, "fault windows cleared by breaker reset");
            }
        });
    }

    async fn announce(&self, current: &BreakerState, t: Transition) {
        match t.to {
            CircuitState::Open => warn!(
                from = %t.from,
                reason = current.reason.as_deref().unwrap_or(""),
                trigger_count = current.trigger_count,
                recovery_attempts = current.recovery_attempts,
                "circuit breaker OPEN"
            ),
            CircuitState::HalfOpen => info!(auto_reset = t.auto_reset, "circuit breaker HALF_OPEN, probing"),
            CircuitState::Closed => info!(from = %t.from, "circuit breaker CLOSED"),
        }

        self.control.notify_breaker(current, t.from).await;

        if let Some(alerts) = &self.alerts {
            match t.to {
                CircuitState::Open => {
                    alerts
                        .circuit_breaker_tripped(current.reason.as_deref().unwrap_or("unknown"))
                        .await;
                }
                CircuitState::Closed => {
                    alerts
                        .info("circuit_breaker", "Circuit Breaker Closed", "all trigger conditions clear")
                        .await;
                }
                CircuitState::HalfOpen => {}
            }
        }
    }

    fn set_cached(&self, st: BreakerState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = st,
            Err(poisoned) => *poisoned.into_inner() = st,
        }
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut FaultCounters) -> T) -> T {
        match self.faults.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
