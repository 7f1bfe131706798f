//! Coordination Layer
//!
//! Shared decision points between the loops and the operator:
//! - Control plane switch and global stop flag
//! - Circuit breaker for automated trading actions
//! - Manual override of auto-heal escalation
//! - Single-instance guard per worker role
//! - Operator command log
//! - Graceful shutdown handling

pub mod circuit_breaker;
pub mod command_log;
pub mod control_plane;
pub mod fault_window;
pub mod instance_guard;
pub mod manual_override;
pub mod shutdown;

pub use circuit_breaker::{
    BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakerStats, CircuitState, Transition,
    TriggerCondition, TriggerKind,
};
pub use command_log::{CommandEntry, CommandLog, CommandVerb, CommandsConfig, DispatchOutcome};
pub use control_plane::{ControlPlane, StopFlag};
pub use fault_window::{CounterTracker, FaultWindow};
pub use instance_guard::{is_process_alive, terminate_process, InstanceGuard};
pub use manual_override::{OverrideConfig, OverrideManager, OverrideStatus, StopPermission};
pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownSignal, ShutdownToken};
