pub mod daemon;
pub mod monitors;
pub mod runner;

pub use daemon::{Daemon, SUPERVISOR_LOCK};
pub use monitors::{AutoHealLoop, BreakerMonitor, HealthMonitor};
pub use runner::{run_periodic, LoopStats, PeriodicTask, Schedule};
