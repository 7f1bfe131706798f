//! End-to-end scenarios across the store, aggregator, breaker, control plane
//! and auto-heal supervisor, with a scripted launcher instead of processes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use warden::coordination::{
    BreakerConfig, CircuitBreaker, CircuitState, ControlPlane, OverrideConfig, OverrideManager,
    TriggerKind,
};
use warden::domain::AuditEvent;
use warden::persistence::keys;
use warden::supervisor::autoheal::Escalation;
use warden::supervisor::{LaunchHandle, WorkerSpec};
use warden::{
    AutoHealConfig, AutoHealSupervisor, Clock, ContractRegistry, ControlReason, DurableStore,
    HealthPublisher, HealthReader, ManualClock, RecoveryError, RecoveryOutcome, Verdict,
    WorkerConfig, WorkerLauncher,
};

/// Launcher whose workers either heartbeat right away or never do
struct FakeLauncher {
    store: DurableStore,
    clock: Arc<ManualClock>,
    healthy: bool,
    launches: AtomicU32,
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> warden::Result<LaunchHandle> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        self.clock.advance_secs(1);
        if self.healthy {
            HealthPublisher::new(self.store.clone(), self.clock.clone(), spec.name.clone())
                .heartbeat()
                .await?;
        }
        Ok(LaunchHandle {
            pid: 50_000 + n,
            launched_at: self.clock.now(),
        })
    }

    async fn stop(&self, _spec: &WorkerSpec, _pid: u32, _force: bool) -> warden::Result<bool> {
        Ok(true)
    }
}

struct World {
    _dir: tempfile::TempDir,
    store: DurableStore,
    clock: Arc<ManualClock>,
    reader: HealthReader,
    control: ControlPlane,
    overrides: OverrideManager,
    launcher: Arc<FakeLauncher>,
}

impl World {
    async fn new(healthy_launches: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let mut contracts = ContractRegistry::new();
        contracts.declare("feeder", 10, true);
        let reader = HealthReader::new(store.clone(), Arc::new(contracts), clock.clone());
        let control = ControlPlane::new(store.clone(), clock.clone());
        control
            .set_state(true, ControlReason::UserToggle, None, "operator")
            .await
            .unwrap();
        let overrides = OverrideManager::new(OverrideConfig::default(), store.clone(), clock.clone());
        let launcher = Arc::new(FakeLauncher {
            store: store.clone(),
            clock: clock.clone(),
            healthy: healthy_launches,
            launches: AtomicU32::new(0),
        });
        Self {
            _dir: dir,
            store,
            clock,
            reader,
            control,
            overrides,
            launcher,
        }
    }

    async fn supervisor(&self) -> AutoHealSupervisor {
        let config = AutoHealConfig {
            ready_timeout_secs: 0,
            ready_poll_ms: 5,
            ..Default::default()
        };
        AutoHealSupervisor::load(
            config,
            BTreeMap::from([("feeder".to_string(), WorkerConfig::default())]),
            self.reader.clone(),
            self.overrides.clone(),
            self.launcher.clone(),
            self.store.clone(),
            self.clock.clone(),
        )
        .await
    }

    async fn breaker(&self) -> CircuitBreaker {
        let config = BreakerConfig {
            watched: vec![TriggerKind::FeederStale],
            ..Default::default()
        };
        CircuitBreaker::load(config, self.store.clone(), self.clock.clone(), self.control.clone()).await
    }

    fn feeder(&self) -> HealthPublisher {
        HealthPublisher::new(self.store.clone(), self.clock.clone(), "feeder")
    }
}

#[tokio::test]
async fn heartbeat_loss_opens_breaker_and_recovery_closes_it() {
    let world = World::new(true).await;
    let breaker = world.breaker().await;
    let supervisor = world.supervisor().await;

    world.feeder().heartbeat().await.unwrap();
    let snapshot = world.reader.snapshot().await.unwrap();
    assert!(snapshot.overall_ready);
    assert_eq!(breaker.evaluate(&snapshot).await.unwrap(), None);

    // Heartbeats stop; one cycle past the ttl the feeder is FAILED
    world.clock.advance_secs(11);
    let snapshot = world.reader.snapshot().await.unwrap();
    assert_eq!(snapshot.verdict_of("feeder"), Some(Verdict::Failed));
    assert!(snapshot.is_failing("feeder"));

    let opened = breaker.evaluate(&snapshot).await.unwrap().unwrap();
    assert_eq!(opened.to, CircuitState::Open);
    let state = breaker.state();
    assert!(state.reason.unwrap().contains("feeder stale"));

    // Trading is gated; automation (and so recovery) is not
    assert!(!world.control.trading_gate().await.enabled);
    assert!(world.control.is_enabled().await.enabled);

    let report = supervisor.tick(&snapshot).await.unwrap();
    assert!(report.outcome("feeder").unwrap().is_recovered());
    assert_eq!(world.launcher.launches.load(Ordering::SeqCst), 1);

    let snapshot = world.reader.snapshot().await.unwrap();
    assert_eq!(snapshot.verdict_of("feeder"), Some(Verdict::Ok));
    // Still inside the recovery timeout: no transition
    assert_eq!(breaker.evaluate(&snapshot).await.unwrap(), None);
    assert_eq!(breaker.state().state, CircuitState::Open);

    world.clock.advance_secs(60);
    world.feeder().heartbeat().await.unwrap();
    let snapshot = world.reader.snapshot().await.unwrap();
    let trial = breaker.evaluate(&snapshot).await.unwrap().unwrap();
    assert_eq!(trial.to, CircuitState::HalfOpen);
    let closed = breaker.evaluate(&snapshot).await.unwrap().unwrap();
    assert_eq!(closed.to, CircuitState::Closed);

    assert!(world.control.trading_gate().await.enabled);
    assert!(snapshot.overall_ready);
}

#[tokio::test]
async fn user_toggle_blocks_recovery_without_spending_budget() {
    let world = World::new(true).await;
    let supervisor = world.supervisor().await;
    world
        .control
        .set_state(false, ControlReason::UserToggle, Some("maintenance".into()), "operator")
        .await
        .unwrap();

    let outcome = supervisor.attempt_recovery("feeder").await.unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::Blocked {
            reason: "user_toggle".into()
        }
    );
    assert_eq!(world.launcher.launches.load(Ordering::SeqCst), 0);
    assert_eq!(supervisor.recovery("feeder").unwrap().window.attempts, 0);

    let events = world.control.events().await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event == "blocked_by_control" && e.reason.as_deref() == Some("user_toggle")));
}

#[tokio::test]
async fn budget_exhaustion_rejects_without_launching() {
    let world = World::new(true).await;
    let supervisor = world.supervisor().await;
    for _ in 0..3 {
        assert!(supervisor.attempt_recovery("feeder").await.unwrap().is_recovered());
    }
    let outcome = supervisor.attempt_recovery("feeder").await.unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::Rejected {
            error: RecoveryError::MaxAttemptsExceeded,
            escalation: None,
        }
    );
    assert_eq!(RecoveryError::MaxAttemptsExceeded.to_string(), "max attempts exceeded");
    assert_eq!(world.launcher.launches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn override_suppresses_escalation_and_records_it() {
    let world = World::new(false).await;
    let supervisor = world.supervisor().await;
    world
        .overrides
        .activate("operator", Some(1800), Some("investigating feeder".into()))
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(supervisor.attempt_recovery("feeder").await.unwrap());
    }
    assert!(matches!(
        outcomes.last().unwrap(),
        RecoveryOutcome::Failed {
            error: RecoveryError::ReadyTimeout { .. },
            escalation: Some(Escalation::Suppressed { .. }),
        }
    ));
    assert!(!world.overrides.can_autoheal_force_stop().await.allowed);
    assert!(!world.control.stop_flag_raised().await);

    let events: Vec<AuditEvent> = world.store.read_log(keys::AUTOHEAL_EVENTS).await.unwrap();
    assert_eq!(
        events.iter().filter(|e| e.event == "would_block_stop").count(),
        1
    );

    // Once the override expires the escalation goes through
    world.clock.advance_secs(1800);
    assert!(world.overrides.can_autoheal_force_stop().await.allowed);
    let snapshot = world.reader.snapshot().await.unwrap();
    supervisor.tick(&snapshot).await.unwrap();
    assert!(world.control.stop_flag_raised().await);
    assert_eq!(world.control.is_enabled().await.reason, "emergency_stop");
    assert!(supervisor.recovery("feeder").unwrap().halted);
}

#[tokio::test]
async fn concurrent_writers_never_expose_torn_values() {
    let dir = tempfile::tempdir().unwrap();
    let store = DurableStore::open(dir.path());
    let key = "breaker.json";

    let mut writers = Vec::new();
    for writer in 0..6u32 {
        let store = store.clone();
        writers.push(tokio::spawn(async move {
            for round in 0..25u32 {
                let value = serde_json::json!({
                    "writer": writer,
                    "round": round,
                    "payload": vec![writer; 512],
                });
                store.write_json(key, &value).await.unwrap();
            }
        }));
    }

    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut seen = 0;
            for _ in 0..200 {
                match store.read_json::<serde_json::Value>(key).await {
                    Ok(value) => {
                        let writer = value["writer"].as_u64().unwrap();
                        let payload = value["payload"].as_array().unwrap();
                        assert_eq!(payload.len(), 512);
                        assert!(payload.iter().all(|v| v.as_u64() == Some(writer)));
                        seen += 1;
                    }
                    Err(warden::WardenError::NotFound(_)) => {}
                    Err(e) => panic!("reader saw an invalid value: {e}"),
                }
                tokio::task::yield_now().await;
            }
            seen
        })
    };

    for w in writers {
        w.await.unwrap();
    }
    reader.await.unwrap();

    let last: serde_json::Value = store.read_json(key).await.unwrap();
    assert_eq!(last["round"], 24);
}
