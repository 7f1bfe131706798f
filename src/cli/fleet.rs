//! Fleet commands: supervise, status, health, heartbeat, command, lock

use super::output::{
    print_error, print_header, print_items, print_json, print_kv, print_success, print_warn,
    OutputMode,
};
use super::{Context, Exit};
use crate::coordination::{install_signal_handlers, CircuitState, CommandVerb, DispatchOutcome, GracefulShutdown};
use crate::domain::{HealthRecord, SystemHealthSnapshot, Verdict};
use crate::error::WardenError;
use crate::health::HealthPublisher;
use crate::persistence::keys;
use crate::services::{Daemon, SUPERVISOR_LOCK};
use crate::supervisor::AutoHealSnapshot;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tabled::Tabled;

pub async fn supervise(ctx: Context) -> Result<Exit> {
    if let Err(errors) = ctx.config.validate() {
        for e in &errors {
            print_error(e);
        }
        bail!("invalid configuration ({} errors)", errors.len());
    }

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone());

    let daemon = Daemon::build(ctx.config.clone(), ctx.clock.clone()).await?;
    match daemon.run(shutdown).await {
        Ok(()) => Ok(Exit::Success),
        Err(WardenError::AlreadyRunning { name, pid }) => {
            print_error(&format!("{name} already running (pid {pid})"));
            Ok(Exit::AlreadyRunning)
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Serialize, Tabled)]
struct ComponentRow {
    component: String,
    verdict: String,
    age: String,
    ttl: u64,
    required: bool,
    cause: String,
}

/// Missing records carry an epoch `last_update` and show no age
fn age_cell(record: &HealthRecord, now: DateTime<Utc>) -> String {
    if record.last_update == DateTime::<Utc>::default() {
        "-".to_string()
    } else {
        format!("{:.1}s", record.age_secs(now))
    }
}

fn component_rows(ctx: &Context, snapshot: &SystemHealthSnapshot) -> Vec<ComponentRow> {
    let contracts = ctx.config.contracts();
    snapshot
        .per_component
        .iter()
        .map(|(name, record)| ComponentRow {
            component: name.clone(),
            verdict: record.verdict.to_string(),
            age: age_cell(record, snapshot.timestamp),
            ttl: record.ttl_seconds,
            required: contracts.get(name).map_or(true, |c| c.required),
            cause: snapshot
                .cause_of(name)
                .map(ToString::to_string)
                .unwrap_or_default(),
        })
        .collect()
}

pub async fn health(ctx: &Context, json: bool) -> Result<Exit> {
    let snapshot = ctx.reader().snapshot().await?;
    if json {
        print_json(&snapshot)?;
    } else {
        print_items(&component_rows(ctx, &snapshot), OutputMode::Table)?;
        if snapshot.overall_ready {
            print_success("system ready");
        } else {
            let failing: Vec<_> = snapshot.failing_components.iter().cloned().collect();
            print_warn(&format!("not ready: {}", failing.join(", ")));
        }
    }
    Ok(Exit::healthy_if(snapshot.overall_ready))
}

#[derive(Debug, Serialize, Tabled)]
struct WorkerRow {
    worker: String,
    state: String,
    target: String,
    attempts: u32,
    failures: u32,
    halted: bool,
    last_action: String,
    last_error: String,
}

pub async fn status(ctx: &Context, json: bool) -> Result<Exit> {
    let snapshot = ctx.reader().snapshot().await?;
    let breaker = ctx.breaker().await.state();
    let control = ctx.control();
    let decision = control.is_enabled().await;
    let trading = control.trading_gate().await;
    let overrides = ctx.overrides().status().await;
    let autoheal: Option<AutoHealSnapshot> = ctx.store.read_json(keys::AUTOHEAL_STATE).await.ok();

    let ok = snapshot.overall_ready && breaker.state == CircuitState::Closed;
    if json {
        print_json(&json!({
            "health": snapshot,
            "breaker": breaker,
            "automation": { "enabled": decision.enabled, "reason": decision.reason },
            "trading": { "enabled": trading.enabled, "reason": trading.reason },
            "override": overrides,
            "autoheal": autoheal,
        }))?;
        return Ok(Exit::healthy_if(ok));
    }

    print_header("WARDEN STATUS");
    print_kv("ready", snapshot.overall_ready);
    print_kv("breaker", breaker.state);
    print_kv(
        "automation",
        format!("{} ({})", if decision.enabled { "enabled" } else { "disabled" }, decision.reason),
    );
    print_kv(
        "trading",
        format!("{} ({})", if trading.enabled { "open" } else { "blocked" }, trading.reason),
    );
    if overrides.effective {
        print_kv("override", format!("active, {}s left", overrides.remaining_secs));
    }

    println!();
    print_items(&component_rows(ctx, &snapshot), OutputMode::Table)?;

    if let Some(autoheal) = autoheal {
        let rows: Vec<WorkerRow> = autoheal
            .workers
            .iter()
            .map(|(name, rec)| WorkerRow {
                worker: name.clone(),
                state: rec.state.to_string(),
                target: format!("{:?}", rec.target).to_lowercase(),
                attempts: rec.window.attempts,
                failures: rec.window.failures,
                halted: rec.halted,
                last_action: rec.last_action.clone().unwrap_or_default(),
                last_error: rec.last_error.clone().unwrap_or_default(),
            })
            .collect();
        println!();
        print_items(&rows, OutputMode::Table)?;
    }
    Ok(Exit::healthy_if(ok))
}

#[derive(Args, Debug)]
pub struct HeartbeatArgs {
    /// Component name
    pub component: String,

    /// ok | degraded | failed (and common synonyms)
    #[arg(short, long, default_value = "ok")]
    pub status: String,

    /// Metric as key=value; values parse as JSON when possible
    #[arg(short, long = "metric")]
    pub metrics: Vec<String>,

    /// Last error message
    #[arg(short, long)]
    pub error: Option<String>,
}

fn parse_metrics(raw: &[String]) -> Result<BTreeMap<String, Value>> {
    raw.iter()
        .map(|kv| {
            let Some((key, value)) = kv.split_once('=') else {
                bail!("metric '{kv}' is not key=value");
            };
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}

pub async fn heartbeat(ctx: &Context, args: HeartbeatArgs) -> Result<Exit> {
    let Some(verdict) = Verdict::parse_status(&args.status) else {
        bail!("unknown status '{}'", args.status);
    };
    let metrics = parse_metrics(&args.metrics)?;
    HealthPublisher::new(ctx.store.clone(), ctx.clock.clone(), args.component.clone())
        .publish(verdict, metrics, args.error)
        .await?;
    print_success(&format!("{} reported {}", args.component, verdict));
    Ok(Exit::Success)
}

pub async fn command(ctx: &Context, verb: &str, target: &str) -> Result<Exit> {
    let verb: CommandVerb = verb.parse()?;
    match ctx.commands().dispatch(verb, target, &ctx.operator).await? {
        DispatchOutcome::Appended(entry) => {
            print_success(&format!("queued {} {} ({})", entry.verb, entry.target, entry.id));
            Ok(Exit::Success)
        }
        DispatchOutcome::Duplicate { existing_id } => {
            print_warn(&format!("duplicate of {existing_id}, not queued again"));
            Ok(Exit::Success)
        }
        DispatchOutcome::CoolingDown { remaining_secs } => {
            print_warn(&format!("{verb} {target} cooling down, retry in {remaining_secs}s"));
            Ok(Exit::Unhealthy)
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Show lock holders (all workers and the supervisor by default)
    Status { name: Option<String> },

    /// Take a worker's lock on behalf of a pid (exit 2 if held)
    Acquire {
        name: String,
        #[arg(long)]
        pid: u32,
    },

    /// Release a lock held by `pid`, or any holder with --force
    Release {
        name: String,
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct LockRow {
    name: String,
    holder: String,
    acquired_at: String,
}

impl LockCommands {
    pub async fn run(self, ctx: &Context) -> Result<Exit> {
        match self {
            Self::Status { name } => {
                let names: Vec<String> = match name {
                    Some(name) => vec![name],
                    None => ctx
                        .config
                        .workers
                        .keys()
                        .cloned()
                        .chain(std::iter::once(SUPERVISOR_LOCK.to_string()))
                        .collect(),
                };
                let guard = ctx.guard_for(std::process::id());
                let mut rows = Vec::with_capacity(names.len());
                for name in names {
                    let holder = guard.holder(&name).await;
                    rows.push(LockRow {
                        name,
                        holder: holder
                            .as_ref()
                            .map(|h| h.pid.to_string())
                            .unwrap_or_else(|| "free".to_string()),
                        acquired_at: holder
                            .map(|h| h.acquired_at.to_rfc3339())
                            .unwrap_or_default(),
                    });
                }
                print_items(&rows, OutputMode::Table)?;
                Ok(Exit::Success)
            }
            Self::Acquire { name, pid } => {
                if ctx.guard_for(pid).acquire(&name).await? {
                    print_success(&format!("{name} locked for pid {pid}"));
                    Ok(Exit::Success)
                } else {
                    let holder = ctx.guard_for(pid).holder(&name).await;
                    print_error(&format!(
                        "{name} already running (pid {})",
                        holder.map(|h| h.pid.to_string()).unwrap_or_else(|| "?".into())
                    ));
                    Ok(Exit::AlreadyRunning)
                }
            }
            Self::Release { name, pid, force } => {
                let guard = ctx.guard_for(pid.unwrap_or_else(std::process::id));
                let released = if force {
                    guard.force_release(&name).await?
                } else {
                    guard.release(&name).await?
                };
                if released {
                    print_success(&format!("{name} lock released"));
                    Ok(Exit::Success)
                } else {
                    print_warn(&format!("{name} lock not released"));
                    Ok(Exit::Unhealthy)
                }
            }
        }
    }
}
