//! The three periodic tasks run by `warden supervise`.

use crate::coordination::CircuitBreaker;
use crate::error::Result;
use crate::health::HealthReader;
use crate::services::runner::PeriodicTask;
use crate::supervisor::{AutoHealSupervisor, RecoveryOutcome};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Aggregates health and publishes the system snapshot
pub struct HealthMonitor {
    reader: HealthReader,
    last_failing: Mutex<Option<BTreeSet<String>>>,
}

impl HealthMonitor {
    pub fn new(reader: HealthReader) -> Self {
        Self {
            reader,
            last_failing: Mutex::new(None),
        }
    }

    /// Swap in the new failing set, returning (newly failing, recovered)
    fn diff(&self, failing: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
        let mut last = match self.last_failing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = last.replace(failing.clone()).unwrap_or_default();
        let newly = failing.difference(&previous).cloned().collect();
        let recovered = previous.difference(failing).cloned().collect();
        (newly, recovered)
    }
}

#[async_trait]
impl PeriodicTask for HealthMonitor {
    fn name(&self) -> &str {
        "health"
    }

    async fn run_once(&self) -> Result<()> {
        let snapshot = self.reader.refresh().await?;
        let (newly, recovered) = self.diff(&snapshot.failing_components);
        for name in newly {
            let cause = snapshot
                .cause_of(&name)
                .map(ToString::to_string)
                .unwrap_or_default();
            warn!(component = %name, cause = %cause, "component failing");
        }
        for name in recovered {
            info!(component = %name, "component healthy again");
        }
        Ok(())
    }
}

/// Evaluates the circuit breaker against a fresh snapshot
pub struct BreakerMonitor {
    reader: HealthReader,
    breaker: Arc<CircuitBreaker>,
}

impl BreakerMonitor {
    pub fn new(reader: HealthReader, breaker: Arc<CircuitBreaker>) -> Self {
        Self { reader, breaker }
    }
}

#[async_trait]
impl PeriodicTask for BreakerMonitor {
    fn name(&self) -> &str {
        "breaker"
    }

    async fn run_once(&self) -> Result<()> {
        let snapshot = self.reader.snapshot().await?;
        if let Some(t) = self.breaker.evaluate(&snapshot).await? {
            debug!(from = %t.from, to = %t.to, auto_reset = t.auto_reset, "breaker cycle transitioned");
        }
        Ok(())
    }
}

/// Drives one auto-heal tick per cycle
pub struct AutoHealLoop {
    reader: HealthReader,
    supervisor: Arc<AutoHealSupervisor>,
}

impl AutoHealLoop {
    pub fn new(reader: HealthReader, supervisor: Arc<AutoHealSupervisor>) -> Self {
        Self { reader, supervisor }
    }
}

#[async_trait]
impl PeriodicTask for AutoHealLoop {
    fn name(&self) -> &str {
        "autoheal"
    }

    async fn run_once(&self) -> Result<()> {
        let snapshot = self.reader.snapshot().await?;
        let report = self.supervisor.tick(&snapshot).await?;
        for worker in &report.workers {
            match &worker.outcome {
                Some(RecoveryOutcome::Recovered { pid }) => {
                    info!(worker = %worker.worker, pid, "worker recovered")
                }
                Some(RecoveryOutcome::Failed { error, .. }) => {
                    warn!(worker = %worker.worker, error = %error, "worker recovery failed")
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ManualClock, Verdict};
    use crate::health::{ContractRegistry, HealthPublisher};
    use crate::persistence::{keys, DurableStore};

    #[tokio::test]
    async fn test_health_monitor_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let mut contracts = ContractRegistry::new();
        contracts.declare("feeder", 10, true);
        let reader = HealthReader::new(store.clone(), Arc::new(contracts), clock.clone());
        let monitor = HealthMonitor::new(reader.clone());

        monitor.run_once().await.unwrap();
        let published = reader.published().await.unwrap();
        assert!(!published.overall_ready);
        assert!(published.is_failing("feeder"));

        HealthPublisher::new(store.clone(), clock.clone(), "feeder")
            .publish(Verdict::Ok, Default::default(), None)
            .await
            .unwrap();
        monitor.run_once().await.unwrap();
        let published = reader.published().await.unwrap();
        assert!(published.overall_ready);
        assert!(store.exists(keys::SYSTEM_SNAPSHOT).await);
    }

    #[test]
    fn test_failing_set_diff() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        let reader = HealthReader::new(
            store,
            Arc::new(ContractRegistry::new()),
            Arc::new(ManualClock::at_epoch(0)),
        );
        let monitor = HealthMonitor::new(reader);

        let set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        assert_eq!(monitor.diff(&set(&["feeder"])), (vec!["feeder".to_string()], vec![]));
        assert_eq!(
            monitor.diff(&set(&["trader"])),
            (vec!["trader".to_string()], vec!["feeder".to_string()])
        );
        assert_eq!(monitor.diff(&set(&["trader"])), (vec![], vec![]));
    }
}
