//! Warden CLI
//!
//! Commands:
//! - `warden supervise` - Run the health, breaker and auto-heal loops
//! - `warden status` / `warden health` - Inspect the fleet
//! - `warden breaker|control|override|stop-flag` - Operator controls
//! - `warden command` - Queue start/stop/restart for the supervisor
//! - `warden lock` - Single-instance locks
//! - `warden heartbeat` - Publish a health record (for scripted workers)
//! - `warden config` - Configuration management

pub mod config;
pub mod controls;
pub mod fleet;
pub mod output;

use crate::config::AppConfig;
use crate::coordination::{CircuitBreaker, CommandLog, ControlPlane, InstanceGuard, OverrideManager};
use crate::domain::{SharedClock, SystemClock};
use crate::error::WardenError;
use crate::health::HealthReader;
use crate::persistence::DurableStore;
use crate::supervisor::AlertManager;
use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Warden health and resilience control plane
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about = "Health and resilience control plane for local trading workers")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding default.toml and $WARDEN_ENV.toml
    #[arg(long, global = true, default_value = "config")]
    pub config_dir: PathBuf,

    /// Override the shared state root (store.root)
    #[arg(long, global = true, env = "WARDEN_STORE__ROOT")]
    pub root: Option<PathBuf>,

    /// Name recorded as the actor of operator actions
    #[arg(long, global = true, env = "WARDEN_OPERATOR", default_value = "cli")]
    pub operator: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor loops until SIGINT/SIGTERM
    Supervise,

    /// One-screen summary: health, breaker, control plane, auto-heal
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Aggregated component health (exit 1 when not ready)
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Publish a health record for a component
    Heartbeat(fleet::HeartbeatArgs),

    /// Circuit breaker
    #[command(subcommand)]
    Breaker(controls::BreakerCommands),

    /// Automation switch
    #[command(subcommand)]
    Control(controls::ControlCommands),

    /// Manual override of auto-heal stop escalation
    #[command(subcommand)]
    Override(controls::OverrideCommands),

    /// Global failsafe stop flag
    #[command(subcommand)]
    StopFlag(controls::StopFlagCommands),

    /// Queue a start/stop/restart for a worker or `all`
    Command {
        /// start | stop | restart
        verb: String,
        /// Worker name or `all`
        target: String,
    },

    /// Single-instance locks
    #[command(subcommand)]
    Lock(fleet::LockCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    Unhealthy,
    AlreadyRunning,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Exit::Success => 0,
            Exit::Unhealthy => 1,
            Exit::AlreadyRunning => 2,
        }
    }

    pub fn healthy_if(ok: bool) -> Self {
        if ok {
            Exit::Success
        } else {
            Exit::Unhealthy
        }
    }

    /// Map a command error to its exit status
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<WardenError>() {
            Some(WardenError::AlreadyRunning { .. }) => Exit::AlreadyRunning,
            _ => Exit::Unhealthy,
        }
    }
}

/// Everything a command needs, built from configuration
pub struct Context {
    pub config: AppConfig,
    pub config_dir: PathBuf,
    pub store: DurableStore,
    pub clock: SharedClock,
    pub operator: String,
}

impl Context {
    pub fn load(global: &GlobalArgs) -> Result<Self> {
        let mut config = AppConfig::load_from(&global.config_dir)
            .with_context(|| format!("loading configuration from {}", global.config_dir.display()))?;
        if let Some(root) = &global.root {
            config.store.root = root.clone();
        }
        let mut ctx = Self::new(config, SystemClock::shared(), &global.operator);
        ctx.config_dir = global.config_dir.clone();
        Ok(ctx)
    }

    pub fn new(config: AppConfig, clock: SharedClock, operator: &str) -> Self {
        Self {
            store: DurableStore::new(config.store.clone()),
            config,
            config_dir: PathBuf::from("config"),
            clock,
            operator: operator.to_string(),
        }
    }

    pub fn reader(&self) -> HealthReader {
        HealthReader::new(
            self.store.clone(),
            Arc::new(self.config.contracts()),
            self.clock.clone(),
        )
    }

    pub fn control(&self) -> ControlPlane {
        ControlPlane::new(self.store.clone(), self.clock.clone())
    }

    pub fn overrides(&self) -> OverrideManager {
        OverrideManager::new(
            self.config.manual_override.clone(),
            self.store.clone(),
            self.clock.clone(),
        )
    }

    pub fn commands(&self) -> CommandLog {
        CommandLog::new(self.config.commands.clone(), self.store.clone(), self.clock.clone())
            .with_targets(self.config.workers.keys())
    }

    pub fn guard_for(&self, pid: u32) -> InstanceGuard {
        InstanceGuard::for_pid(self.store.clone(), self.clock.clone(), pid)
    }

    pub async fn breaker(&self) -> CircuitBreaker {
        let alerts = AlertManager::new(self.config.alerts.clone(), self.store.clone(), self.clock.clone());
        CircuitBreaker::load(
            self.config.breaker.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.control(),
        )
        .await
        .with_alerts(Arc::new(alerts))
    }
}

impl Commands {
    /// Long-running commands log to file as well as the console
    pub fn is_long_running(&self) -> bool {
        matches!(self, Commands::Supervise)
    }

    pub async fn run(self, ctx: Context) -> Result<Exit> {
        match self {
            Commands::Supervise => fleet::supervise(ctx).await,
            Commands::Status { json } => fleet::status(&ctx, json).await,
            Commands::Health { json } => fleet::health(&ctx, json).await,
            Commands::Heartbeat(args) => fleet::heartbeat(&ctx, args).await,
            Commands::Breaker(cmd) => cmd.run(&ctx).await,
            Commands::Control(cmd) => cmd.run(&ctx).await,
            Commands::Override(cmd) => cmd.run(&ctx).await,
            Commands::StopFlag(cmd) => cmd.run(&ctx).await,
            Commands::Command { verb, target } => fleet::command(&ctx, &verb, &target).await,
            Commands::Lock(cmd) => cmd.run(&ctx).await,
            Commands::Config(cmd) => cmd.run(&ctx),
        }
    }
}
