//! Auto-Heal Supervisor
//!
//! Restarts unhealthy workers under a bounded per-window budget, asks the
//! control plane before every automated restart, and escalates repeated
//! failures to the global stop flag unless a manual override is active.

use crate::coordination::command_log::{CommandEntry, CommandLog, CommandVerb, ALL_TARGET};
use crate::coordination::{ControlPlane, InstanceGuard, OverrideManager};
use crate::domain::{AuditEvent, SharedClock, SystemHealthSnapshot, Verdict};
use crate::error::{RecoveryError, Result, WardenError};
use crate::health::{HealthPublisher, HealthReader};
use crate::persistence::{keys, DurableStore};
use crate::supervisor::alert_manager::AlertManager;
use crate::supervisor::launcher::{wait_exit, wait_ready, WorkerConfig, WorkerLauncher, WorkerSpec};
use crate::supervisor::playbook::{HealAction, RecoveryPlaybook};
use crate::supervisor::recovery::{
    AutoHealSnapshot, RecoveryState, WorkerRecovery, WorkerTarget,
};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Name the supervisor publishes its own heartbeat under
pub const AUTOHEAL_COMPONENT: &str = "autoheal";

/// Configuration for the auto-heal supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoHealConfig {
    /// Master switch for automated restarts (default: true)
    pub enabled: bool,
    /// Interval between supervision ticks (default: 10s)
    pub interval_secs: u64,
    /// Restart attempts allowed per window (default: 3)
    pub max_attempts_per_window: u32,
    /// Rolling budget window (default: 600s)
    pub window_secs: u64,
    /// Wait for a post-launch heartbeat (default: 30s)
    pub ready_timeout_secs: u64,
    /// Ready-signal poll interval (default: 500ms)
    pub ready_poll_ms: u64,
    /// Consecutive failed recoveries before raising the global stop (default: 3)
    pub escalate_after_failures: u32,
    /// Consecutive windows with a spent budget before raising the global stop (default: 3)
    pub escalate_after_exhausted_windows: u32,
    /// Pause after the budget is spent (default: 300s)
    pub quarantine_secs: u64,
    /// Grace period for a hung worker to exit before SIGKILL (default: 5s)
    pub stop_grace_secs: u64,
    /// First retry delay of the supervision loop after an error (default: 1s)
    pub backoff_base_secs: u64,
    /// Retry delay cap of the supervision loop (default: 60s)
    pub backoff_max_secs: u64,
}

impl Default for AutoHealConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            max_attempts_per_window: 3,
            window_secs: 600,
            ready_timeout_secs: 30,
            ready_poll_ms: 500,
            escalate_after_failures: 3,
            escalate_after_exhausted_windows: 3,
            quarantine_secs: 300,
            stop_grace_secs: 5,
            backoff_base_secs: 1,
            backoff_max_secs: 60,
        }
    }
}

/// What escalation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    StopRaised,
    /// Override active; recorded as `would_block_stop`
    Suppressed { reason: String },
}

/// Result of one recovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered { pid: u32 },
    /// Control plane said no; nothing was counted
    Blocked { reason: String },
    /// Refused before launching; a spent budget may escalate
    Rejected {
        error: RecoveryError,
        escalation: Option<Escalation>,
    },
    Failed {
        error: RecoveryError,
        escalation: Option<Escalation>,
    },
}

impl RecoveryOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, RecoveryOutcome::Recovered { .. })
    }
}

/// One worker's result within a tick
#[derive(Debug, Clone)]
pub struct WorkerTick {
    pub worker: String,
    pub action: HealAction,
    pub outcome: Option<RecoveryOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub workers: Vec<WorkerTick>,
    pub commands: Vec<(CommandEntry, String)>,
}

impl TickReport {
    pub fn outcome(&self, worker: &str) -> Option<&RecoveryOutcome> {
        self.workers
            .iter()
            .find(|w| w.worker == worker)
            .and_then(|w| w.outcome.as_ref())
    }

    pub fn action(&self, worker: &str) -> Option<&HealAction> {
        self.workers.iter().find(|w| w.worker == worker).map(|w| &w.action)
    }
}

pub struct AutoHealSupervisor {
    config: AutoHealConfig,
    workers: BTreeMap<String, WorkerSpec>,
    store: DurableStore,
    clock: SharedClock,
    reader: HealthReader,
    control: ControlPlane,
    overrides: OverrideManager,
    guard: InstanceGuard,
    launcher: Arc<dyn WorkerLauncher>,
    alerts: Option<Arc<AlertManager>>,
    commands: Option<CommandLog>,
    playbook: RecoveryPlaybook,
    publisher: HealthPublisher,
    recoveries: Mutex<BTreeMap<String, WorkerRecovery>>,
}

impl AutoHealSupervisor {
    /// Create a supervisor, restoring per-worker state from `autoheal.json`
    pub async fn load(
        config: AutoHealConfig,
        workers: BTreeMap<String, WorkerConfig>,
        reader: HealthReader,
        overrides: OverrideManager,
        launcher: Arc<dyn WorkerLauncher>,
        store: DurableStore,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        let mut recoveries: BTreeMap<String, WorkerRecovery> =
            match store.read_json::<AutoHealSnapshot>(keys::AUTOHEAL_STATE).await {
                Ok(snapshot) => snapshot.workers,
                Err(WardenError::NotFound(_)) => BTreeMap::new(),
                Err(e) => {
                    warn!(error = %e, "auto-heal state unreadable, starting fresh");
                    BTreeMap::new()
                }
            };
        recoveries.retain(|name, _| workers.contains_key(name));
        for name in workers.keys() {
            recoveries
                .entry(name.clone())
                .or_insert_with(|| WorkerRecovery::new(config.window_secs, now));
        }

        let workers = workers
            .into_iter()
            .map(|(name, cfg)| (name.clone(), WorkerSpec::new(name, cfg)))
            .collect();

        Self {
            control: ControlPlane::new(store.clone(), clock.clone()),
            guard: InstanceGuard::new(store.clone(), clock.clone()),
            publisher: HealthPublisher::new(store.clone(), clock.clone(), AUTOHEAL_COMPONENT),
            playbook: RecoveryPlaybook::new(),
            recoveries: Mutex::new(recoveries),
            alerts: None,
            commands: None,
            config,
            workers,
            store,
            clock,
            reader,
            overrides,
            launcher,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Consume operator commands from this log on every tick
    pub fn with_commands(mut self, commands: CommandLog) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn config(&self) -> &AutoHealConfig {
        &self.config
    }

    pub fn worker_names(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn recovery(&self, worker: &str) -> Option<WorkerRecovery> {
        self.with_recoveries(|r| r.get(worker).cloned())
    }

    pub fn snapshot(&self) -> AutoHealSnapshot {
        AutoHealSnapshot {
            updated_at: self.clock.now(),
            enabled: self.config.enabled,
            workers: self.with_recoveries(|r| r.clone()),
        }
    }

    /// Try to bring one worker back: control-plane gate, budget check,
    /// stale-lock cleanup, launch, ready wait, validation.
    pub async fn attempt_recovery(&self, worker: &str) -> Result<RecoveryOutcome> {
        let spec = self.spec(worker)?;
        let now = self.clock.now();
        let mut rec = self.current(worker);
        rec.window.roll(now);

        let decision = self.control.is_enabled().await;
        if !decision.enabled {
            let reason = decision.reason;
            let repeated =
                rec.state == RecoveryState::Blocked && rec.last_error.as_deref() == Some(reason.as_str());
            rec.transition(RecoveryState::Blocked, now);
            rec.last_action = Some("blocked_by_control".to_string());
            rec.last_error = Some(reason.clone());
            self.put(worker, rec);
            if !repeated {
                info!(worker, reason = %reason, "recovery blocked by control plane");
                self.control
                    .record_blocked(AUTOHEAL_COMPONENT, &format!("restart:{worker}"), &reason)
                    .await;
                self.event(worker, "recovery_blocked", Some(&reason), json!({})).await;
            }
            self.persist().await?;
            return Ok(RecoveryOutcome::Blocked { reason });
        }

        if rec.halted {
            return Ok(RecoveryOutcome::Rejected {
                error: RecoveryError::Halted,
                escalation: None,
            });
        }

        if rec.window.exhausted(self.config.max_attempts_per_window) {
            let error = RecoveryError::MaxAttemptsExceeded;
            // Count each spent window once, however often it is re-checked
            let newly_spent = !rec.window.exhaustion_counted;
            if newly_spent {
                rec.window.exhaustion_counted = true;
                rec.exhausted_windows += 1;
            }
            let exhausted_windows = rec.exhausted_windows;
            warn!(
                worker,
                attempts = rec.window.attempts,
                window_secs = rec.window.window_seconds,
                exhausted_windows,
                "recovery budget exhausted"
            );
            rec.transition(RecoveryState::Failed, now);
            rec.last_action = Some("budget_exhausted".to_string());
            rec.last_error = Some(error.to_string());
            rec.quarantined_until =
                Some(now + ChronoDuration::seconds(self.config.quarantine_secs as i64));
            self.put(worker, rec);
            self.event(
                worker,
                "recovery_rejected",
                Some(&error.to_string()),
                json!({ "exhausted_windows": exhausted_windows }),
            )
            .await;

            let escalation = if newly_spent
                && exhausted_windows >= self.config.escalate_after_exhausted_windows
            {
                let reason =
                    format!("restart budget exhausted in {exhausted_windows} consecutive windows");
                Some(self.escalate(worker, &reason).await?)
            } else {
                None
            };
            self.persist().await?;
            return Ok(RecoveryOutcome::Rejected { error, escalation });
        }

        rec.window.attempts += 1;
        let attempt = rec.window.attempts;
        rec.transition(RecoveryState::Recovering, now);
        rec.last_action = Some("restarting".to_string());
        self.put(worker, rec);
        self.persist().await?;
        info!(
            worker,
            attempt,
            max = self.config.max_attempts_per_window,
            "attempting recovery"
        );

        let result = self.relaunch(&spec).await;
        self.finish(worker, result, true).await
    }

    /// One supervision pass over every worker
    pub async fn tick(&self, snapshot: &SystemHealthSnapshot) -> Result<TickReport> {
        let mut report = TickReport::default();
        if !self.config.enabled {
            debug!("auto-heal disabled, skipping tick");
            self.heartbeat().await;
            return Ok(report);
        }

        report.commands = self.process_commands().await?;
        let commanded: BTreeSet<&str> = report
            .commands
            .iter()
            .flat_map(|(entry, _)| {
                if entry.target == ALL_TARGET {
                    self.workers.keys().map(String::as_str).collect::<Vec<_>>()
                } else {
                    vec![entry.target.as_str()]
                }
            })
            .collect();
        let stop_raised = self.control.stop_flag_raised().await;

        for name in self.workers.keys() {
            let Some(verdict) = snapshot.verdict_of(name) else {
                debug!(worker = %name, "worker has no health contract, skipping");
                continue;
            };
            // The snapshot predates the command; act on the next one
            if commanded.contains(name.as_str()) {
                report.workers.push(WorkerTick {
                    worker: name.clone(),
                    action: HealAction::Hold {
                        reason: "operator command this tick".to_string(),
                    },
                    outcome: None,
                });
                continue;
            }
            let now = self.clock.now();
            let mut rec = self.current(name);
            rec.window.roll(now);

            if rec.halted && !stop_raised {
                info!(worker = %name, "stop flag cleared by operator, resuming recovery");
                rec.halted = false;
                rec.pending_escalation = false;
                rec.stop_suppressed = false;
                rec.consecutive_failures = 0;
                rec.exhausted_windows = 0;
                rec.quarantined_until = None;
                rec.window.reset(now);
                rec.transition(RecoveryState::Idle, now);
                rec.last_action = Some("resumed".to_string());
                self.event(name, "recovery_resumed", None, json!({})).await;
            }

            if rec.observe_health(verdict.is_ok(), now) {
                debug!(worker = %name, "healthy for a full window, budget reset");
            }
            if verdict.is_ok() && rec.state != RecoveryState::Recovering {
                rec.transition(RecoveryState::Idle, now);
            }
            let action = self
                .playbook
                .decide(verdict, snapshot.cause_of(name), &rec, now);
            self.put(name, rec);

            let outcome = match &action {
                HealAction::None => None,
                HealAction::Monitor => {
                    debug!(worker = %name, "degraded, monitoring");
                    None
                }
                HealAction::Quarantine { until } => {
                    debug!(worker = %name, until = %until, "quarantined");
                    None
                }
                HealAction::Hold { reason } => {
                    debug!(worker = %name, reason = %reason, "holding");
                    None
                }
                HealAction::Restart { reason } => {
                    info!(worker = %name, reason = %reason, "restart required");
                    Some(self.attempt_recovery(name).await?)
                }
                HealAction::Escalate { reason } => match self.escalate(name, reason).await? {
                    Escalation::StopRaised => None,
                    Escalation::Suppressed { .. } => {
                        let rec = self.current(name);
                        match self.playbook.remedy(verdict, snapshot.cause_of(name), &rec, now) {
                            HealAction::Restart { .. } => Some(self.attempt_recovery(name).await?),
                            _ => None,
                        }
                    }
                },
            };
            report.workers.push(WorkerTick {
                worker: name.clone(),
                action,
                outcome,
            });
        }

        self.persist().await?;
        self.heartbeat().await;
        Ok(report)
    }

    /// Execute one operator command against one worker (or `all`)
    pub async fn execute_command(&self, verb: CommandVerb, target: &str, by: &str) -> Result<Vec<String>> {
        let targets: Vec<String> = if target == ALL_TARGET {
            self.workers.keys().cloned().collect()
        } else {
            self.spec(target)?;
            vec![target.to_string()]
        };

        let mut results = Vec::with_capacity(targets.len());
        for worker in targets {
            let summary = match verb {
                CommandVerb::Stop => self.stop_worker(&worker, by).await?,
                CommandVerb::Start => {
                    self.set_target(&worker, WorkerTarget::Running);
                    if let Some(holder) = self.guard.holder(&worker).await {
                        format!("{worker} already running (pid {})", holder.pid)
                    } else {
                        self.operator_restart(&worker, by).await?
                    }
                }
                CommandVerb::Restart => {
                    self.set_target(&worker, WorkerTarget::Running);
                    self.operator_restart(&worker, by).await?
                }
            };
            results.push(summary);
        }
        self.persist().await?;
        Ok(results)
    }

    async fn process_commands(&self) -> Result<Vec<(CommandEntry, String)>> {
        let Some(log) = &self.commands else {
            return Ok(Vec::new());
        };
        let mut done = Vec::new();
        for entry in log.take_pending().await? {
            let summary = match self
                .execute_command(entry.verb, &entry.target, &entry.issued_by)
                .await
            {
                Ok(lines) => lines.join("; "),
                Err(WardenError::UnknownWorker(w)) => {
                    warn!(worker = %w, id = %entry.id, "command for unknown worker ignored");
                    format!("unknown worker {w}")
                }
                Err(e) => return Err(e),
            };
            info!(id = %entry.id, verb = %entry.verb, target = %entry.target, result = %summary, "command executed");
            done.push((entry, summary));
        }
        Ok(done)
    }

    async fn stop_worker(&self, worker: &str, by: &str) -> Result<String> {
        let spec = self.spec(worker)?;
        self.set_target(worker, WorkerTarget::Stopped);
        let summary = match self.guard.holder(worker).await {
            Some(holder) => {
                self.launcher.stop(&spec, holder.pid, false).await?;
                if !wait_exit(holder.pid, self.stop_grace(), self.poll()).await {
                    self.launcher.stop(&spec, holder.pid, true).await?;
                }
                format!("{worker} stopped (pid {})", holder.pid)
            }
            None => format!("{worker} not running"),
        };
        self.update(worker, |rec, now| {
            rec.last_action = Some("stopped_by_operator".to_string());
            rec.updated_at = now;
        });
        self.event(worker, "worker_stopped", None, json!({ "by": by })).await;
        Ok(summary)
    }

    async fn operator_restart(&self, worker: &str, by: &str) -> Result<String> {
        let spec = self.spec(worker)?;
        self.update(worker, |rec, now| {
            rec.transition(RecoveryState::Recovering, now);
            rec.last_action = Some(format!("restart_requested_by_{by}"));
        });
        let result = self.relaunch(&spec).await;
        Ok(match self.finish(worker, result, false).await? {
            RecoveryOutcome::Recovered { pid } => format!("{worker} restarted (pid {pid})"),
            RecoveryOutcome::Failed { error, .. } => format!("{worker} restart failed: {error}"),
            other => format!("{worker}: {other:?}"),
        })
    }

    /// Stop a live-but-unhealthy holder, clear stale locks, launch, wait, validate
    async fn relaunch(&self, spec: &WorkerSpec) -> std::result::Result<u32, RecoveryError> {
        let start_failed = |e: WardenError| RecoveryError::StartFailed(e.to_string());

        if let Some(holder) = self.guard.holder(&spec.name).await {
            warn!(worker = %spec.name, pid = holder.pid, "worker alive but unhealthy, stopping it first");
            self.launcher
                .stop(spec, holder.pid, false)
                .await
                .map_err(start_failed)?;
            if !wait_exit(holder.pid, self.stop_grace(), self.poll()).await {
                self.launcher
                    .stop(spec, holder.pid, true)
                    .await
                    .map_err(start_failed)?;
                if !wait_exit(holder.pid, self.stop_grace(), self.poll()).await {
                    return Err(RecoveryError::AlreadyRunning {
                        worker: spec.name.clone(),
                        pid: holder.pid,
                    });
                }
            }
        }
        self.guard
            .clear_stale(&spec.name)
            .await
            .map_err(start_failed)?;

        let launched_at = self.clock.now();
        let handle = self.launcher.launch(spec).await.map_err(start_failed)?;

        let timeout_secs = spec
            .config
            .ready_timeout_secs
            .unwrap_or(self.config.ready_timeout_secs);
        let record = wait_ready(
            &self.reader,
            &spec.name,
            launched_at,
            Duration::from_secs(timeout_secs),
            self.poll(),
        )
        .await
        .ok_or(RecoveryError::ReadyTimeout { timeout_secs })?;

        spec.config
            .validation
            .check(Some(&record), self.clock.now())
            .map_err(RecoveryError::ValidationFailed)?;
        Ok(handle.pid)
    }

    async fn finish(
        &self,
        worker: &str,
        result: std::result::Result<u32, RecoveryError>,
        automatic: bool,
    ) -> Result<RecoveryOutcome> {
        let now = self.clock.now();
        let mut rec = self.current(worker);

        let outcome = match result {
            Ok(pid) => {
                rec.window.successes += 1;
                rec.consecutive_failures = 0;
                rec.pending_escalation = false;
                rec.stop_suppressed = false;
                rec.quarantined_until = None;
                rec.transition(RecoveryState::Succeeded, now);
                rec.last_action = Some("restarted".to_string());
                rec.last_error = None;
                rec.last_pid = Some(pid);
                self.put(worker, rec);

                info!(worker, pid, "recovery succeeded");
                self.event(worker, "recovery_succeeded", None, json!({ "pid": pid }))
                    .await;
                if let Some(alerts) = &self.alerts {
                    alerts
                        .info(worker, "Component Recovered", &format!("restarted as pid {pid}"))
                        .await;
                }
                RecoveryOutcome::Recovered { pid }
            }
            Err(error) => {
                rec.window.failures += 1;
                rec.consecutive_failures += 1;
                rec.transition(RecoveryState::Failed, now);
                rec.last_action = Some("restart_failed".to_string());
                rec.last_error = Some(error.to_string());
                let consecutive = rec.consecutive_failures;
                self.put(worker, rec);

                warn!(worker, error = %error, consecutive, "recovery failed");
                self.event(
                    worker,
                    "recovery_failed",
                    Some(&error.to_string()),
                    json!({ "consecutive_failures": consecutive }),
                )
                .await;
                if let Some(alerts) = &self.alerts {
                    alerts.component_failed(worker, &error.to_string()).await;
                }

                let escalation = if automatic && consecutive >= self.config.escalate_after_failures
                {
                    let reason = format!("{consecutive} consecutive failed recoveries ({error})");
                    Some(self.escalate(worker, &reason).await?)
                } else {
                    None
                };
                RecoveryOutcome::Failed { error, escalation }
            }
        };

        self.persist().await?;
        Ok(outcome)
    }

    /// Raise the global stop for `worker`, unless a manual override is active
    async fn escalate(&self, worker: &str, reason: &str) -> Result<Escalation> {
        let permission = self.overrides.can_autoheal_force_stop().await;
        let mut rec = self.current(worker);
        let now = self.clock.now();

        if permission.allowed {
            self.control
                .raise_stop(AUTOHEAL_COMPONENT, &format!("{worker}: {reason}"))
                .await?;
            rec.halted = true;
            rec.pending_escalation = false;
            rec.stop_suppressed = false;
            rec.last_action = Some("stop_raised".to_string());
            rec.updated_at = now;
            let attempts = rec.consecutive_failures;
            self.put(worker, rec);

            error!(worker, reason, "recovery exhausted, global stop raised");
            self.event(worker, "stop_raised", Some(reason), json!({})).await;
            if let Some(alerts) = &self.alerts {
                alerts.restart_exhausted(worker, attempts).await;
            }
            return Ok(Escalation::StopRaised);
        }

        let first = !rec.stop_suppressed;
        rec.pending_escalation = true;
        rec.stop_suppressed = true;
        rec.last_action = Some("stop_suppressed".to_string());
        rec.updated_at = now;
        self.put(worker, rec);

        if first {
            self.overrides
                .record_suppressed_stop(worker, reason, &permission.reason)
                .await?;
            if let Some(alerts) = &self.alerts {
                alerts.stop_suppressed(worker, &permission.reason).await;
            }
        }
        Ok(Escalation::Suppressed {
            reason: permission.reason,
        })
    }

    async fn heartbeat(&self) {
        let snapshot = self.snapshot();
        let halted = snapshot.workers.values().filter(|r| r.halted).count();
        let recovering = snapshot
            .workers
            .values()
            .filter(|r| r.state == RecoveryState::Recovering)
            .count();
        let verdict = if halted > 0 { Verdict::Degraded } else { Verdict::Ok };
        let metrics = BTreeMap::from([
            ("enabled".to_string(), json!(self.config.enabled)),
            ("workers".to_string(), json!(snapshot.workers.len())),
            ("halted".to_string(), json!(halted)),
            ("recovering".to_string(), json!(recovering)),
        ]);
        if let Err(e) = self.publisher.publish(verdict, metrics, None).await {
            warn!(error = %e, "failed to publish auto-heal heartbeat");
        }
    }

    async fn persist(&self) -> Result<()> {
        self.store
            .write_json(keys::AUTOHEAL_STATE, &self.snapshot())
            .await
    }

    async fn event(&self, worker: &str, event: &str, reason: Option<&str>, detail: serde_json::Value) {
        let mut entry = AuditEvent::new(self.clock.now(), AUTOHEAL_COMPONENT, event)
            .subject(worker)
            .detail(detail);
        if let Some(reason) = reason {
            entry = entry.reason(reason);
        }
        if let Err(e) = self.store.append_json(keys::AUTOHEAL_EVENTS, &entry).await {
            warn!(error = %e, event, "failed to append auto-heal event");
        }
    }

    fn spec(&self, worker: &str) -> Result<WorkerSpec> {
        self.workers
            .get(worker)
            .cloned()
            .ok_or_else(|| WardenError::UnknownWorker(worker.to_string()))
    }

    fn poll(&self) -> Duration {
        Duration::from_millis(self.config.ready_poll_ms.max(1))
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.config.stop_grace_secs)
    }

    fn set_target(&self, worker: &str, target: WorkerTarget) {
        self.update(worker, |rec, now| {
            rec.target = target;
            rec.updated_at = now;
        });
    }

    fn current(&self, worker: &str) -> WorkerRecovery {
        let window = self.config.window_secs;
        let now = self.clock.now();
        self.with_recoveries(|r| {
            r.get(worker)
                .cloned()
                .unwrap_or_else(|| WorkerRecovery::new(window, now))
        })
    }

    fn put(&self, worker: &str, rec: WorkerRecovery) {
        self.with_recoveries(|r| {
            r.insert(worker.to_string(), rec);
        });
    }

    fn update(&self, worker: &str, f: impl FnOnce(&mut WorkerRecovery, chrono::DateTime<chrono::Utc>)) {
        let now = self.clock.now();
        let mut rec = self.current(worker);
        f(&mut rec, now);
        self.put(worker, rec);
    }

    fn with_recoveries<T>(&self, f: impl FnOnce(&mut BTreeMap<String, WorkerRecovery>) -> T) -> T {
        match self.recoveries.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CommandsConfig, OverrideConfig};
    use crate::domain::{Clock, ControlReason, ManualClock};
    use crate::health::ContractRegistry;
    use crate::supervisor::launcher::LaunchHandle;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Healthy,
        Silent,
        StartError,
    }

    struct ScriptedLauncher {
        store: DurableStore,
        clock: Arc<ManualClock>,
        script: Mutex<VecDeque<Script>>,
        launches: AtomicU32,
    }

    impl ScriptedLauncher {
        fn new(store: DurableStore, clock: Arc<ManualClock>, script: &[Script]) -> Self {
            Self {
                store,
                clock,
                script: Mutex::new(script.iter().copied().collect()),
                launches: AtomicU32::new(0),
            }
        }

        fn launches(&self) -> u32 {
            self.launches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkerLauncher for ScriptedLauncher {
        async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchHandle> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Healthy);
            self.clock.advance_secs(1);
            match step {
                Script::Healthy => {
                    HealthPublisher::new(self.store.clone(), self.clock.clone(), spec.name.clone())
                        .heartbeat()
                        .await?;
                }
                Script::Silent => {}
                Script::StartError => {
                    return Err(WardenError::LaunchFailed {
                        worker: spec.name.clone(),
                        reason: "exec format error".into(),
                    })
                }
            }
            Ok(LaunchHandle {
                pid: 40_000 + n,
                launched_at: chrono::Utc::now(),
            })
        }

        async fn stop(&self, _spec: &WorkerSpec, _pid: u32, _force: bool) -> Result<bool> {
            Ok(true)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: DurableStore,
        clock: Arc<ManualClock>,
        control: ControlPlane,
        overrides: OverrideManager,
        reader: HealthReader,
        launcher: Arc<ScriptedLauncher>,
        supervisor: AutoHealSupervisor,
    }

    async fn fixture(config: AutoHealConfig, script: &[Script]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let mut contracts = ContractRegistry::new();
        contracts.declare("feeder", 10, true);
        let reader = HealthReader::new(store.clone(), Arc::new(contracts), clock.clone());
        let overrides = OverrideManager::new(OverrideConfig::default(), store.clone(), clock.clone());
        let launcher = Arc::new(ScriptedLauncher::new(store.clone(), clock.clone(), script));
        let workers = BTreeMap::from([("feeder".to_string(), WorkerConfig::default())]);

        let supervisor = AutoHealSupervisor::load(
            config,
            workers,
            reader.clone(),
            overrides.clone(),
            launcher.clone(),
            store.clone(),
            clock.clone(),
        )
        .await;
        let control = ControlPlane::new(store.clone(), clock.clone());
        control
            .set_state(true, ControlReason::UserToggle, None, "test")
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            store,
            clock,
            control,
            overrides,
            reader,
            launcher,
            supervisor,
        }
    }

    fn fast() -> AutoHealConfig {
        AutoHealConfig {
            ready_timeout_secs: 0,
            ready_poll_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_blocked_by_user_toggle() {
        let f = fixture(fast(), &[]).await;
        f.control
            .set_state(false, ControlReason::UserToggle, None, "operator")
            .await
            .unwrap();

        let outcome = f.supervisor.attempt_recovery("feeder").await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Blocked {
                reason: "user_toggle".into()
            }
        );
        assert_eq!(f.launcher.launches(), 0);

        let rec = f.supervisor.recovery("feeder").unwrap();
        assert_eq!(rec.state, RecoveryState::Blocked);
        assert_eq!(rec.window.attempts, 0);
        assert_eq!(rec.last_action.as_deref(), Some("blocked_by_control"));

        let events = f.control.events().await.unwrap();
        let blocked = events.last().unwrap();
        assert_eq!(blocked.event, "blocked_by_control");
        assert_eq!(blocked.reason.as_deref(), Some("user_toggle"));

        // Repeated refusals are not re-logged
        f.supervisor.attempt_recovery("feeder").await.unwrap();
        assert_eq!(f.control.events().await.unwrap().len(), events.len());
    }

    #[tokio::test]
    async fn test_fourth_attempt_exceeds_budget() {
        let f = fixture(fast(), &[]).await;
        for _ in 0..3 {
            assert!(f.supervisor.attempt_recovery("feeder").await.unwrap().is_recovered());
        }
        let outcome = f.supervisor.attempt_recovery("feeder").await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Rejected {
                error: RecoveryError::MaxAttemptsExceeded,
                escalation: None,
            }
        );
        assert_eq!(f.launcher.launches(), 3);

        let rec = f.supervisor.recovery("feeder").unwrap();
        assert_eq!(rec.state, RecoveryState::Failed);
        assert_eq!(rec.last_error.as_deref(), Some("max attempts exceeded"));
        assert!(rec.is_quarantined(f.clock.now()));
        assert_eq!(rec.window.successes, 3);

        // Budget returns once the window rolls
        f.clock.advance_secs(600);
        assert!(f.supervisor.attempt_recovery("feeder").await.unwrap().is_recovered());
    }

    #[tokio::test]
    async fn test_repeated_budget_exhaustion_escalates() {
        // Every restart validates, but the worker keeps dying
        let f = fixture(fast(), &[]).await;
        for window in 1..=3u32 {
            for _ in 0..3 {
                assert!(f.supervisor.attempt_recovery("feeder").await.unwrap().is_recovered());
            }
            let outcome = f.supervisor.attempt_recovery("feeder").await.unwrap();
            let (error, escalation) = match outcome {
                RecoveryOutcome::Rejected { error, escalation } => (error, escalation),
                other => panic!("expected a rejection, got {other:?}"),
            };
            assert_eq!(error, RecoveryError::MaxAttemptsExceeded);

            if window < 3 {
                assert_eq!(escalation, None);
                // Re-checking a spent window does not count it twice
                f.supervisor.attempt_recovery("feeder").await.unwrap();
                assert_eq!(f.supervisor.recovery("feeder").unwrap().exhausted_windows, window);
                assert!(!f.control.stop_flag_raised().await);
                f.clock.advance_secs(600);
            } else {
                assert_eq!(escalation, Some(Escalation::StopRaised));
            }
        }

        assert!(f.control.stop_flag_raised().await);
        let rec = f.supervisor.recovery("feeder").unwrap();
        assert!(rec.halted);
        assert_eq!(rec.exhausted_windows, 3);
        assert_eq!(f.launcher.launches(), 9);
        assert_eq!(
            f.supervisor.attempt_recovery("feeder").await.unwrap(),
            RecoveryOutcome::Blocked {
                reason: "emergency_stop".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failures_escalate_to_stop_flag() {
        let script = [Script::Silent, Script::StartError, Script::Silent];
        let f = fixture(fast(), &script).await;

        let first = f.supervisor.attempt_recovery("feeder").await.unwrap();
        assert!(matches!(
            first,
            RecoveryOutcome::Failed {
                error: RecoveryError::ReadyTimeout { .. },
                escalation: None
            }
        ));
        let second = f.supervisor.attempt_recovery("feeder").await.unwrap();
        assert!(matches!(
            second,
            RecoveryOutcome::Failed {
                error: RecoveryError::StartFailed(_),
                escalation: None
            }
        ));
        let third = f.supervisor.attempt_recovery("feeder").await.unwrap();
        assert!(matches!(
            third,
            RecoveryOutcome::Failed {
                escalation: Some(Escalation::StopRaised),
                ..
            }
        ));

        assert!(f.control.stop_flag_raised().await);
        assert!(f.supervisor.recovery("feeder").unwrap().halted);
        assert_eq!(
            f.supervisor.attempt_recovery("feeder").await.unwrap(),
            RecoveryOutcome::Blocked {
                reason: "emergency_stop".into()
            }
        );

        // Operator clears the flag; the next tick resumes and restarts
        f.control.clear_stop("operator").await.unwrap();
        let snapshot = f.reader.snapshot().await.unwrap();
        let report = f.supervisor.tick(&snapshot).await.unwrap();
        assert!(report.outcome("feeder").unwrap().is_recovered());
        let rec = f.supervisor.recovery("feeder").unwrap();
        assert!(!rec.halted);
        assert_eq!(rec.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_override_suppresses_stop() {
        let script = [Script::Silent, Script::Silent, Script::Silent];
        let f = fixture(fast(), &script).await;
        f.overrides.activate("operator", Some(3600), None).await.unwrap();

        let mut last = None;
        for _ in 0..3 {
            last = Some(f.supervisor.attempt_recovery("feeder").await.unwrap());
        }
        assert!(matches!(
            last.unwrap(),
            RecoveryOutcome::Failed {
                escalation: Some(Escalation::Suppressed { .. }),
                ..
            }
        ));
        assert!(!f.control.stop_flag_raised().await);
        assert!(!f.overrides.can_autoheal_force_stop().await.allowed);

        let events: Vec<AuditEvent> = f.store.read_log(keys::AUTOHEAL_EVENTS).await.unwrap();
        let suppressed: Vec<_> = events.iter().filter(|e| e.event == "would_block_stop").collect();
        assert_eq!(suppressed.len(), 1);
        assert_eq!(suppressed[0].subject.as_deref(), Some("feeder"));

        // Override lifted: the pending escalation goes through on the next tick
        f.overrides.deactivate("operator").await.unwrap();
        let snapshot = f.reader.snapshot().await.unwrap();
        let report = f.supervisor.tick(&snapshot).await.unwrap();
        assert_eq!(report.action("feeder").unwrap().as_str(), "escalate");
        assert!(f.control.stop_flag_raised().await);
    }

    #[tokio::test]
    async fn test_tick_follows_verdicts() {
        let f = fixture(fast(), &[]).await;
        let feeder = HealthPublisher::new(f.store.clone(), f.clock.clone(), "feeder");

        feeder.publish(Verdict::Degraded, BTreeMap::new(), None).await.unwrap();
        let report = f.supervisor.tick(&f.reader.snapshot().await.unwrap()).await.unwrap();
        assert_eq!(report.action("feeder"), Some(&HealAction::Monitor));
        assert_eq!(f.launcher.launches(), 0);

        // Heartbeat stops; after the ttl the worker is FAILED and restarted
        f.clock.advance_secs(11);
        let report = f.supervisor.tick(&f.reader.snapshot().await.unwrap()).await.unwrap();
        assert_eq!(report.action("feeder").unwrap().as_str(), "restart");
        assert!(report.outcome("feeder").unwrap().is_recovered());

        let report = f.supervisor.tick(&f.reader.snapshot().await.unwrap()).await.unwrap();
        assert_eq!(report.action("feeder"), Some(&HealAction::None));
        assert_eq!(f.supervisor.recovery("feeder").unwrap().state, RecoveryState::Idle);

        let stored: AutoHealSnapshot = f.store.read_json(keys::AUTOHEAL_STATE).await.unwrap();
        assert_eq!(stored.workers["feeder"].window.successes, 1);
        assert!(f.store.exists(&keys::health(AUTOHEAL_COMPONENT)).await);
    }

    #[tokio::test]
    async fn test_operator_commands() {
        let f = fixture(fast(), &[]).await;
        let log = CommandLog::new(CommandsConfig::default(), f.store.clone(), f.clock.clone())
            .with_targets(["feeder"]);
        let supervisor = f.supervisor.with_commands(log.clone());

        log.dispatch(CommandVerb::Stop, "feeder", "cli").await.unwrap();
        let report = supervisor.tick(&f.reader.snapshot().await.unwrap()).await.unwrap();
        assert_eq!(report.commands.len(), 1);
        assert_eq!(report.action("feeder").unwrap().as_str(), "hold");
        assert_eq!(f.launcher.launches(), 0);

        log.dispatch(CommandVerb::Restart, ALL_TARGET, "cli").await.unwrap();
        let report = supervisor.tick(&f.reader.snapshot().await.unwrap()).await.unwrap();
        assert!(report.commands[0].1.contains("restarted"));
        assert_eq!(f.launcher.launches(), 1);
        let rec = supervisor.recovery("feeder").unwrap();
        assert_eq!(rec.target, WorkerTarget::Running);
        // Operator restarts do not spend the automatic budget
        assert_eq!(rec.window.attempts, 0);
    }

    #[tokio::test]
    async fn test_state_restored_after_restart() {
        let f = fixture(fast(), &[]).await;
        f.supervisor.attempt_recovery("feeder").await.unwrap();

        let restored = AutoHealSupervisor::load(
            fast(),
            BTreeMap::from([("feeder".to_string(), WorkerConfig::default())]),
            f.reader.clone(),
            f.overrides.clone(),
            f.launcher.clone(),
            f.store.clone(),
            f.clock.clone(),
        )
        .await;
        assert_eq!(restored.recovery("feeder").unwrap().window.attempts, 1);
    }
}
