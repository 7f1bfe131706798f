//! Worker launching
//!
//! The supervisor never spawns processes directly; it goes through a
//! [`WorkerLauncher`]. [`ProcessLauncher`] starts real OS processes with an
//! explicit environment, a resolved working directory and a resolved
//! executable, detached from the supervisor's own stdio.

use crate::coordination::instance_guard::{is_process_alive, terminate_process};
use crate::domain::{HealthRecord, Verdict};
use crate::error::{Result, WardenError};
use crate::health::HealthReader;
use crate::persistence::{keys, DurableStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Post-launch check run against the worker's own health record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRule {
    /// Heartbeat must be at most this old when validated (default: 30s)
    pub max_age_secs: u64,
    /// Reported status must be OK, not merely DEGRADED (default: true)
    pub require_ok: bool,
    /// Boolean metrics that must be present and true
    pub required_flags: Vec<String>,
}

impl Default for ValidationRule {
    fn default() -> Self {
        Self {
            max_age_secs: 30,
            require_ok: true,
            required_flags: Vec::new(),
        }
    }
}

impl ValidationRule {
    pub fn check(&self, record: Option<&HealthRecord>, now: DateTime<Utc>) -> std::result::Result<(), String> {
        let record = record.ok_or_else(|| "no health record".to_string())?;
        let age = record.age_secs(now);
        if age > self.max_age_secs as f64 {
            return Err(format!("heartbeat {:.1}s old (max {}s)", age, self.max_age_secs));
        }
        match record.verdict {
            Verdict::Failed => {
                return Err(format!(
                    "worker reports FAILED: {}",
                    record.last_error.as_deref().unwrap_or("no reason")
                ))
            }
            Verdict::Degraded if self.require_ok => {
                return Err("worker reports DEGRADED".to_string())
            }
            _ => {}
        }
        for flag in &self.required_flags {
            if record.metric_bool(flag) != Some(true) {
                return Err(format!("required flag '{flag}' not set"));
            }
        }
        Ok(())
    }
}

/// How to start one worker role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Relative paths resolve against the supervisor's working directory
    pub working_dir: Option<PathBuf>,
    /// Extra variables; the child otherwise inherits only PATH
    pub env: BTreeMap<String, String>,
    /// Output file; defaults to `logs/<name>.log` under the store root
    pub log_file: Option<PathBuf>,
    /// Overrides `autoheal.ready_timeout_secs`
    pub ready_timeout_secs: Option<u64>,
    pub validation: ValidationRule,
}

/// A named worker ready to launch
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub config: WorkerConfig,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchHandle {
    pub pid: u32,
    pub launched_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start the worker. Returns once the process exists, not once it is ready.
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchHandle>;

    /// Ask a running worker to exit; `force` kills it
    async fn stop(&self, spec: &WorkerSpec, pid: u32, force: bool) -> Result<bool>;
}

/// Launches workers as detached OS processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    store: DurableStore,
}

impl ProcessLauncher {
    pub fn new(store: DurableStore) -> Self {
        Self { store }
    }

    fn resolve_cwd(config: &WorkerConfig) -> Result<PathBuf> {
        let base = std::env::current_dir()?;
        let dir = match &config.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base,
        };
        let dir = dir.canonicalize()?;
        if !dir.is_dir() {
            return Err(WardenError::InvalidConfig(format!(
                "working_dir {} is not a directory",
                dir.display()
            )));
        }
        Ok(dir)
    }

    fn resolve_program(program: &str, cwd: &Path) -> Result<PathBuf> {
        if program.trim().is_empty() {
            return Err(WardenError::InvalidConfig("worker program is empty".to_string()));
        }
        let candidate = Path::new(program);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            let path = if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                cwd.join(candidate)
            };
            return if path.is_file() {
                Ok(path)
            } else {
                Err(WardenError::InvalidConfig(format!(
                    "executable {} not found",
                    path.display()
                )))
            };
        }

        let search = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&search)
            .map(|dir| dir.join(program))
            .find(|path| path.is_file())
            .ok_or_else(|| WardenError::InvalidConfig(format!("executable {program} not on PATH")))
    }

    fn open_log(&self, spec: &WorkerSpec, cwd: &Path) -> Result<std::fs::File> {
        let path = match &spec.config.log_file {
            Some(file) if file.is_absolute() => file.clone(),
            Some(file) => cwd.join(file),
            None => self.store.path_for(&keys::worker_log(&spec.name))?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchHandle> {
        let launch_failed = |reason: String| WardenError::LaunchFailed {
            worker: spec.name.clone(),
            reason,
        };

        let cwd = Self::resolve_cwd(&spec.config).map_err(|e| launch_failed(e.to_string()))?;
        let program = Self::resolve_program(&spec.config.program, &cwd)
            .map_err(|e| launch_failed(e.to_string()))?;
        let stdout = self.open_log(spec, &cwd)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&spec.config.args)
            .current_dir(&cwd)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(&spec.config.env)
            .env("WARDEN_WORKER", &spec.name)
            .env("WARDEN_STORE__ROOT", self.store.root());

        let mut child = cmd.spawn().map_err(|e| launch_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_failed("process exited before reporting a pid".to_string()))?;
        info!(worker = %spec.name, pid, program = %program.display(), "worker launched");

        // Reap the child so it never lingers as a zombie
        let name = spec.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(worker = %name, pid, %status, "worker exited"),
                Err(e) => warn!(worker = %name, pid, error = %e, "failed to wait on worker"),
            }
        });

        Ok(LaunchHandle {
            pid,
            launched_at: Utc::now(),
        })
    }

    async fn stop(&self, spec: &WorkerSpec, pid: u32, force: bool) -> Result<bool> {
        if !is_process_alive(pid) {
            return Ok(false);
        }
        let delivered = terminate_process(pid, force);
        info!(worker = %spec.name, pid, force, delivered, "stop signal sent");
        Ok(delivered)
    }
}

/// Poll until the worker publishes a heartbeat newer than `since`.
///
/// Returns the fresh record, or `None` when `timeout` elapses first.
pub async fn wait_ready(
    reader: &HealthReader,
    worker: &str,
    since: DateTime<Utc>,
    timeout: Duration,
    poll: Duration,
) -> Option<HealthRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match reader.load_record(worker).await {
            Ok(Some(record)) if record.last_update > since => return Some(record),
            Ok(_) => {}
            Err(e) => debug!(worker, error = %e, "ready check read failed"),
        }
        if tokio::time::Instant::now() + poll > deadline {
            return None;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Wait up to `grace` for `pid` to exit
pub async fn wait_exit(pid: u32, grace: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while is_process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
    true
}
