//! Supervisor Layer
//!
//! Automated recovery of worker processes:
//! - Auto-heal loop with a bounded restart budget and stop escalation
//! - Worker launching, readiness wait and post-launch validation
//! - Recovery playbook and per-worker bookkeeping
//! - Alert manager for operator notifications

pub mod alert_manager;
pub mod autoheal;
pub mod launcher;
pub mod playbook;
pub mod recovery;

pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertManagerConfig};
pub use autoheal::{
    AutoHealConfig, AutoHealSupervisor, Escalation, RecoveryOutcome, TickReport, WorkerTick,
    AUTOHEAL_COMPONENT,
};
pub use launcher::{
    LaunchHandle, ProcessLauncher, ValidationRule, WorkerConfig, WorkerLauncher, WorkerSpec,
};
pub use playbook::{HealAction, RecoveryPlaybook};
pub use recovery::{AutoHealSnapshot, RecoveryState, RecoveryWindow, WorkerRecovery, WorkerTarget};
