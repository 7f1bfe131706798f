use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum WardenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Store errors
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    #[error("Store write failed for {key} after {attempts} attempts: {reason}")]
    StoreWriteFailed {
        key: String,
        attempts: u32,
        reason: String,
    },

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Process supervision errors
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Worker {name} already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("Launch failed for {worker}: {reason}")]
    LaunchFailed { worker: String, reason: String },

    #[error("Blocked: {reason}")]
    Blocked { reason: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for WardenError
pub type Result<T> = std::result::Result<T, WardenError>;

/// Reasons a single recovery attempt did not produce a healthy worker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("blocked by control plane: {reason}")]
    Blocked { reason: String },

    #[error("max attempts exceeded")]
    MaxAttemptsExceeded,

    #[error("worker halted pending operator intervention")]
    Halted,

    #[error("{worker} already running (pid {pid})")]
    AlreadyRunning { worker: String, pid: u32 },

    #[error("start failed: {0}")]
    StartFailed(String),

    #[error("no ready signal within {timeout_secs}s")]
    ReadyTimeout { timeout_secs: u64 },

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

impl From<RecoveryError> for WardenError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::Blocked { reason } => WardenError::Blocked { reason },
            RecoveryError::AlreadyRunning { worker, pid } => {
                WardenError::AlreadyRunning { name: worker, pid }
            }
            other => WardenError::Internal(other.to_string()),
        }
    }
}
