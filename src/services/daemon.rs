//! Wires the control plane components together for `warden supervise`.

use crate::config::AppConfig;
use crate::coordination::{
    CircuitBreaker, CommandLog, ControlPlane, GracefulShutdown, InstanceGuard, OverrideManager,
};
use crate::domain::SharedClock;
use crate::error::Result;
use crate::health::HealthReader;
use crate::persistence::DurableStore;
use crate::services::monitors::{AutoHealLoop, BreakerMonitor, HealthMonitor};
use crate::services::runner::{run_periodic, Schedule};
use crate::supervisor::{AlertManager, AutoHealSupervisor, ProcessLauncher, WorkerLauncher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lock name held by the running supervisor process
pub const SUPERVISOR_LOCK: &str = "supervisor";

/// Every long-lived component of one supervisor process
pub struct Daemon {
    config: AppConfig,
    store: DurableStore,
    clock: SharedClock,
    reader: HealthReader,
    breaker: Arc<CircuitBreaker>,
    supervisor: Arc<AutoHealSupervisor>,
}

impl Daemon {
    /// Build with the real process launcher
    pub async fn build(config: AppConfig, clock: SharedClock) -> Result<Self> {
        let store = DurableStore::new(config.store.clone());
        let launcher = Arc::new(ProcessLauncher::new(store.clone()));
        Self::build_with(config, clock, launcher).await
    }

    pub async fn build_with(
        config: AppConfig,
        clock: SharedClock,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self> {
        let store = DurableStore::new(config.store.clone());
        tokio::fs::create_dir_all(store.root()).await?;

        let reader = HealthReader::new(store.clone(), Arc::new(config.contracts()), clock.clone());
        let alerts = Arc::new(AlertManager::new(
            config.alerts.clone(),
            store.clone(),
            clock.clone(),
        ));
        let control = ControlPlane::new(store.clone(), clock.clone());

        let breaker = CircuitBreaker::load(
            config.breaker.clone(),
            store.clone(),
            clock.clone(),
            control,
        )
        .await
        .with_alerts(alerts.clone());

        let overrides = OverrideManager::new(
            config.manual_override.clone(),
            store.clone(),
            clock.clone(),
        );
        let commands = CommandLog::new(config.commands.clone(), store.clone(), clock.clone())
            .with_targets(config.workers.keys());
        let supervisor = AutoHealSupervisor::load(
            config.autoheal.clone(),
            config.workers.clone(),
            reader.clone(),
            overrides,
            launcher,
            store.clone(),
            clock.clone(),
        )
        .await
        .with_alerts(alerts)
        .with_commands(commands);

        Ok(Self {
            config,
            store,
            clock,
            reader,
            breaker: Arc::new(breaker),
            supervisor: Arc::new(supervisor),
        })
    }

    pub fn supervisor(&self) -> &Arc<AutoHealSupervisor> {
        &self.supervisor
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run every loop until shutdown. Fails with `AlreadyRunning` if another
    /// supervisor holds the lock.
    pub async fn run(self, shutdown: Arc<GracefulShutdown>) -> Result<()> {
        let guard = InstanceGuard::new(self.store.clone(), self.clock.clone());
        guard.acquire_or_fail(SUPERVISOR_LOCK).await?;
        info!(
            root = %self.store.root().display(),
            workers = self.config.workers.len(),
            autoheal = self.config.autoheal.enabled,
            "supervisor started"
        );

        let autoheal = &self.config.autoheal;
        let backoff = |interval: u64| {
            Schedule::every(Duration::from_secs(interval)).with_backoff(
                Duration::from_secs(autoheal.backoff_base_secs),
                Duration::from_secs(autoheal.backoff_max_secs),
            )
        };

        let handles = vec![
            tokio::spawn(run_periodic(
                Arc::new(HealthMonitor::new(self.reader.clone())),
                backoff(self.config.health.interval_secs),
                shutdown.token(),
            )),
            tokio::spawn(run_periodic(
                Arc::new(BreakerMonitor::new(self.reader.clone(), self.breaker.clone())),
                backoff(self.config.breaker.interval_secs),
                shutdown.token(),
            )),
            tokio::spawn(run_periodic(
                Arc::new(AutoHealLoop::new(self.reader.clone(), self.supervisor.clone())),
                backoff(autoheal.interval_secs),
                shutdown.token(),
            )),
        ];

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "supervisor loop ended abnormally");
            }
        }

        guard.release(SUPERVISOR_LOCK).await?;
        info!("supervisor stopped");
        Ok(())
    }
}
