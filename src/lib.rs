pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod health;
pub mod logging;
pub mod persistence;
pub mod services;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{
    CircuitBreaker, CircuitState, CommandLog, CommandVerb, ControlPlane, GracefulShutdown,
    InstanceGuard, OverrideManager, ShutdownSignal,
};
pub use domain::{
    Clock, ControlDecision, ControlReason, HealthRecord, ManualClock, SharedClock,
    SystemClock, SystemHealthSnapshot, Verdict,
};
pub use error::{RecoveryError, Result, WardenError};
pub use health::{ContractRegistry, HealthPublisher, HealthReader};
pub use persistence::{DurableStore, StoreConfig};
pub use services::Daemon;
pub use supervisor::{
    AlertManager, AutoHealConfig, AutoHealSupervisor, ProcessLauncher, RecoveryOutcome,
    WorkerConfig, WorkerLauncher,
};
