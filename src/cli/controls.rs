//! Operator controls
//!
//! warden breaker status|trip|reset
//! warden control status|enable|disable|emergency-stop
//! warden override activate|deactivate|extend|status
//! warden stop-flag status|clear

use super::output::{print_header, print_json, print_kv, print_success, print_warn};
use super::{Context, Exit};
use crate::coordination::CircuitState;
use crate::domain::ControlReason;
use anyhow::Result;
use clap::Subcommand;
use serde_json::json;

#[derive(Subcommand, Debug)]
pub enum BreakerCommands {
    /// Show breaker state (exit 1 unless CLOSED)
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Open the breaker; stays open until `breaker reset`
    Trip {
        #[arg(short, long)]
        reason: String,
    },

    /// Force the breaker CLOSED and clear fault windows
    Reset,
}

impl BreakerCommands {
    pub async fn run(self, ctx: &Context) -> Result<Exit> {
        let breaker = ctx.breaker().await;
        match self {
            Self::Status { json } => {
                let stats = breaker.get_stats();
                if json {
                    print_json(&stats)?;
                } else {
                    let st = &stats.state;
                    print_header("CIRCUIT BREAKER");
                    print_kv("state", st.state);
                    print_kv("reason", st.reason.as_deref().unwrap_or("-"));
                    print_kv(
                        "opened_at",
                        st.opened_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                    );
                    print_kv("trigger_count", st.trigger_count);
                    print_kv("recovery_attempts", st.recovery_attempts);
                    print_kv(
                        "conditions",
                        st.active_conditions.iter().cloned().collect::<Vec<_>>().join(", "),
                    );
                    if let Some(manual) = &st.manual_trip {
                        print_kv("manual_trip", manual);
                    }
                }
                Ok(Exit::healthy_if(stats.state.state == CircuitState::Closed))
            }
            Self::Trip { reason } => {
                let st = breaker.trip(&reason, &ctx.operator).await?;
                print_warn(&format!("breaker {} ({})", st.state, reason));
                Ok(Exit::Success)
            }
            Self::Reset => {
                let st = breaker.reset(&ctx.operator).await?;
                print_success(&format!("breaker {}", st.state));
                Ok(Exit::Success)
            }
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ControlCommands {
    /// Show whether automated actions may run (exit 1 when disabled)
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Enable automated actions
    Enable {
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Disable automated actions
    Disable {
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Raise the global stop flag and disable automation
    EmergencyStop {
        #[arg(short, long)]
        reason: String,
    },
}

impl ControlCommands {
    pub async fn run(self, ctx: &Context) -> Result<Exit> {
        let control = ctx.control();
        match self {
            Self::Status { json } => {
                let state = control.get_state().await;
                let decision = control.is_enabled().await;
                let flag = control.stop_flag().await;
                if json {
                    print_json(&json!({
                        "state": state,
                        "enabled": decision.enabled,
                        "reason": decision.reason,
                        "stop_flag": flag.as_ref().map(|f| json!({
                            "raised_by": f.raised_by,
                            "reason": f.reason,
                            "raised_at": f.raised_at,
                        })),
                    }))?;
                } else {
                    print_header("CONTROL PLANE");
                    print_kv("automation", if decision.enabled { "enabled" } else { "disabled" });
                    print_kv("reason", &decision.reason);
                    print_kv("switch", state.automated_actions_enabled);
                    print_kv("since", state.since.to_rfc3339());
                    print_kv("changed_by", state.changed_by.as_deref().unwrap_or("-"));
                    if let Some(note) = &state.note {
                        print_kv("note", note);
                    }
                    if let Some(flag) = &flag {
                        print_warn(&format!("stop flag raised by {}: {}", flag.raised_by, flag.reason));
                    }
                }
                Ok(Exit::healthy_if(decision.enabled))
            }
            Self::Enable { note } => {
                control
                    .set_state(true, ControlReason::UserToggle, note, &ctx.operator)
                    .await?;
                if control.stop_flag_raised().await {
                    print_warn("switch enabled, but the stop flag is still raised");
                } else {
                    print_success("automated actions enabled");
                }
                Ok(Exit::Success)
            }
            Self::Disable { note } => {
                control
                    .set_state(false, ControlReason::UserToggle, note, &ctx.operator)
                    .await?;
                print_success("automated actions disabled");
                Ok(Exit::Success)
            }
            Self::EmergencyStop { reason } => {
                control.emergency_stop(&ctx.operator, &reason).await?;
                print_warn("EMERGENCY STOP raised; clear with `warden stop-flag clear`");
                Ok(Exit::Success)
            }
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum OverrideCommands {
    /// Stop auto-heal from raising the global stop for a while
    Activate {
        /// Lifetime in seconds (default: override.default_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// End the override now
    Deactivate,

    /// Push the expiry out
    Extend {
        #[arg(long)]
        secs: u64,
    },

    /// Show the override and its remaining time
    Status {
        #[arg(long)]
        json: bool,
    },
}

impl OverrideCommands {
    pub async fn run(self, ctx: &Context) -> Result<Exit> {
        let overrides = ctx.overrides();
        match self {
            Self::Activate { ttl, reason } => {
                let record = overrides.activate(&ctx.operator, ttl, reason).await?;
                let expires = record.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                print_success(&format!("manual override active until {expires}"));
                Ok(Exit::Success)
            }
            Self::Deactivate => {
                if overrides.deactivate(&ctx.operator).await? {
                    print_success("manual override ended");
                } else {
                    print_warn("no manual override was active");
                }
                Ok(Exit::Success)
            }
            Self::Extend { secs } => {
                let record = overrides.extend(&ctx.operator, secs).await?;
                let expires = record.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                print_success(&format!("manual override extended until {expires}"));
                Ok(Exit::Success)
            }
            Self::Status { json } => {
                let status = overrides.status().await;
                if json {
                    print_json(&status)?;
                } else {
                    print_header("MANUAL OVERRIDE");
                    print_kv("effective", status.effective);
                    print_kv("remaining_secs", status.remaining_secs);
                    print_kv("started_by", status.record.started_by.as_deref().unwrap_or("-"));
                    print_kv("reason", status.record.reason.as_deref().unwrap_or("-"));
                }
                Ok(Exit::Success)
            }
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum StopFlagCommands {
    /// Show the stop flag (exit 1 while raised)
    Status,

    /// Remove the stop flag
    Clear,
}

impl StopFlagCommands {
    pub async fn run(self, ctx: &Context) -> Result<Exit> {
        let control = ctx.control();
        match self {
            Self::Status => match control.stop_flag().await {
                Some(flag) => {
                    print_warn("EMERGENCY STOP raised");
                    print_kv("raised_by", &flag.raised_by);
                    print_kv("reason", &flag.reason);
                    print_kv("raised_at", &flag.raised_at);
                    Ok(Exit::Unhealthy)
                }
                None => {
                    print_success("stop flag not raised");
                    Ok(Exit::Success)
                }
            },
            Self::Clear => {
                if control.clear_stop(&ctx.operator).await? {
                    print_success("stop flag cleared; halted workers resume on the next auto-heal tick");
                } else {
                    print_warn("stop flag was not raised");
                }
                Ok(Exit::Success)
            }
        }
    }
}
