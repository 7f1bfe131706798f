//! Well-known store keys shared by every process

/// Aggregated system health, rewritten every cycle
pub const SYSTEM_SNAPSHOT: &str = "system_snapshot.json";

/// Persisted circuit-breaker state
pub const BREAKER: &str = "breaker.json";

/// Control-plane automation switch
pub const CONTROL: &str = "controls/auto_trading.json";

/// Manual override record
pub const MANUAL_OVERRIDE: &str = "controls/manual_override.json";

/// Audit log of control-plane changes and breaker notifications
pub const CONTROL_EVENTS: &str = "controls/events.jsonl";

/// Global failsafe stop marker; presence halts all automation
pub const STOP_FLAG: &str = "STOP.TXT";

/// Auto-heal per-worker state, for dashboards
pub const AUTOHEAL_STATE: &str = "autoheal.json";

/// Auto-heal decisions, escalations and suppressed stops
pub const AUTOHEAL_EVENTS: &str = "logs/autoheal_events.jsonl";

/// Alerts raised by any subsystem
pub const ALERTS: &str = "logs/alerts.jsonl";

/// Ordered operator command log
pub const COMMANDS: &str = "commands/commands.jsonl";

/// How far the supervisor has consumed the command log
pub const COMMAND_CURSOR: &str = "commands/cursor.json";

/// Heartbeat/health record for a component
pub fn health(component: &str) -> String {
    format!("health/{component}.json")
}

/// Single-instance lock for a worker role
pub fn lock(name: &str) -> String {
    format!("locks/{name}.pid")
}

/// Captured stdout/stderr of a launched worker
pub fn worker_log(name: &str) -> String {
    format!("logs/{name}.log")
}
