//! Command Log
//!
//! Operator commands (`start|stop|restart` on a worker or `all`) appended to
//! an ordered log. Each entry carries an idempotency key derived from the
//! verb, target and time bucket; repeats inside a per-(verb,target) cooldown
//! are refused. The supervisor consumes new entries through a stored cursor.

use crate::domain::SharedClock;
use crate::error::{Result, WardenError};
use crate::persistence::{keys, DurableStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info};

/// Target naming every configured worker
pub const ALL_TARGET: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandVerb {
    Start,
    Stop,
    Restart,
}

impl CommandVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandVerb::Start => "start",
            CommandVerb::Stop => "stop",
            CommandVerb::Restart => "restart",
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CommandVerb {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(CommandVerb::Start),
            "stop" => Ok(CommandVerb::Stop),
            "restart" => Ok(CommandVerb::Restart),
            other => Err(WardenError::Validation(format!("unknown command verb: {other}"))),
        }
    }
}

/// One line of the command log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub id: String,
    pub verb: CommandVerb,
    pub target: String,
    pub idempotency_key: String,
    pub issued_at: DateTime<Utc>,
    pub issued_by: String,
}

/// Result of a dispatch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Appended(CommandEntry),
    /// Same key already in the log
    Duplicate { existing_id: String },
    CoolingDown { remaining_secs: i64 },
}

impl DispatchOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, DispatchOutcome::Appended(_))
    }
}

/// Configuration for the command surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Minimum spacing between identical (verb, target) commands (default: 30s)
    pub cooldown_secs: u64,
    /// Width of the idempotency time bucket (default: 60s), capped at the
    /// cooldown so a repeat allowed by the cooldown never hashes to an
    /// earlier entry's key
    pub idempotency_bucket_secs: u64,
}

impl CommandsConfig {
    pub fn effective_bucket_secs(&self) -> u64 {
        self.idempotency_bucket_secs.min(self.cooldown_secs).max(1)
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            idempotency_bucket_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Cursor {
    consumed: usize,
}

/// First 16 hex chars of sha256("verb:target:bucket")
pub fn idempotency_key(verb: CommandVerb, target: &str, bucket: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", verb.as_str(), target, bucket).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

#[derive(Debug, Clone)]
pub struct CommandLog {
    config: CommandsConfig,
    store: DurableStore,
    clock: SharedClock,
    targets: Vec<String>,
}

impl CommandLog {
    pub fn new(config: CommandsConfig, store: DurableStore, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
            targets: Vec::new(),
        }
    }

    /// Restrict targets to these worker names (plus `all`)
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Append a command unless it duplicates or is cooling down
    pub async fn dispatch(
        &self,
        verb: CommandVerb,
        target: &str,
        issued_by: &str,
    ) -> Result<DispatchOutcome> {
        let target = target.trim();
        if target.is_empty() {
            return Err(WardenError::Validation("command target is empty".to_string()));
        }
        if target != ALL_TARGET
            && !self.targets.is_empty()
            && !self.targets.iter().any(|t| t == target)
        {
            return Err(WardenError::UnknownWorker(target.to_string()));
        }

        let now = self.clock.now();
        let bucket = now.timestamp() / self.config.effective_bucket_secs() as i64;
        let key = idempotency_key(verb, target, bucket);
        let log = self.entries().await?;

        if let Some(existing) = log.iter().find(|e| e.idempotency_key == key) {
            debug!(%verb, target, key = %key, "duplicate command ignored");
            return Ok(DispatchOutcome::Duplicate {
                existing_id: existing.id.clone(),
            });
        }

        if let Some(last) = log
            .iter()
            .rev()
            .find(|e| e.verb == verb && e.target == target)
        {
            let elapsed = (now - last.issued_at).num_seconds();
            let cooldown = self.config.cooldown_secs as i64;
            if elapsed < cooldown {
                return Ok(DispatchOutcome::CoolingDown {
                    remaining_secs: cooldown - elapsed,
                });
            }
        }

        let entry = CommandEntry {
            id: uuid::Uuid::new_v4().to_string(),
            verb,
            target: target.to_string(),
            idempotency_key: key,
            issued_at: now,
            issued_by: issued_by.to_string(),
        };
        self.store.append_json(keys::COMMANDS, &entry).await?;
        info!(%verb, target, by = issued_by, id = %entry.id, "command appended");
        Ok(DispatchOutcome::Appended(entry))
    }

    /// Full log, oldest first
    pub async fn entries(&self) -> Result<Vec<CommandEntry>> {
        self.store.read_log(keys::COMMANDS).await
    }

    /// Entries appended since the last call, advancing the cursor past them
    pub async fn take_pending(&self) -> Result<Vec<CommandEntry>> {
        let cursor: Cursor = self
            .store
            .read_json_or(keys::COMMAND_CURSOR, Cursor::default())
            .await;
        let log = self.entries().await?;
        if cursor.consumed >= log.len() {
            return Ok(Vec::new());
        }
        let pending = log[cursor.consumed..].to_vec();
        self.store
            .write_json(keys::COMMAND_CURSOR, &Cursor { consumed: log.len() })
            .await?;
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use std::sync::Arc;

    fn command_log() -> (tempfile::TempDir, Arc<ManualClock>, CommandLog) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let log = CommandLog::new(
            CommandsConfig::default(),
            DurableStore::open(dir.path()),
            clock.clone(),
        )
        .with_targets(["feeder", "trader"]);
        (dir, clock, log)
    }

    #[test]
    fn test_idempotency_key_shape() {
        let key = idempotency_key(CommandVerb::Restart, "feeder", 28_333_333);
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, idempotency_key(CommandVerb::Restart, "feeder", 28_333_333));
        assert_ne!(key, idempotency_key(CommandVerb::Restart, "feeder", 28_333_334));
        assert_ne!(key, idempotency_key(CommandVerb::Stop, "feeder", 28_333_333));
    }

    #[test]
    fn test_verb_parse() {
        assert_eq!("RESTART".parse::<CommandVerb>().unwrap(), CommandVerb::Restart);
        assert!("reboot".parse::<CommandVerb>().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_within_bucket() {
        let (_dir, _clock, log) = command_log();
        let first = log.dispatch(CommandVerb::Restart, "feeder", "cli").await.unwrap();
        let DispatchOutcome::Appended(entry) = first else {
            panic!("expected append");
        };
        let second = log.dispatch(CommandVerb::Restart, "feeder", "ui").await.unwrap();
        assert_eq!(
            second,
            DispatchOutcome::Duplicate {
                existing_id: entry.id
            }
        );
        assert_eq!(log.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_across_buckets() {
        let (_dir, clock, log) = command_log();
        // 1_700_000_000 sits 20s into its 30s bucket
        clock.advance_secs(35);
        assert!(log.dispatch(CommandVerb::Stop, "trader", "cli").await.unwrap().is_appended());

        // Next bucket, still inside the cooldown
        clock.advance_secs(10);
        assert_eq!(
            log.dispatch(CommandVerb::Stop, "trader", "cli").await.unwrap(),
            DispatchOutcome::CoolingDown { remaining_secs: 20 }
        );

        // Other verbs are independent
        assert!(log.dispatch(CommandVerb::Start, "trader", "cli").await.unwrap().is_appended());

        clock.advance_secs(60);
        assert!(log.dispatch(CommandVerb::Stop, "trader", "cli").await.unwrap().is_appended());
    }

    #[tokio::test]
    async fn test_repeat_after_cooldown_is_not_a_duplicate() {
        let (_dir, clock, log) = command_log();
        // 1_700_000_000 and +35s share a 60s bucket
        let DispatchOutcome::Appended(first) =
            log.dispatch(CommandVerb::Restart, "feeder", "cli").await.unwrap()
        else {
            panic!("expected append");
        };
        clock.advance_secs(35);
        let DispatchOutcome::Appended(second) =
            log.dispatch(CommandVerb::Restart, "feeder", "cli").await.unwrap()
        else {
            panic!("repeat past the cooldown must be accepted");
        };
        assert_ne!(first.idempotency_key, second.idempotency_key);
        assert_eq!(log.entries().await.unwrap().len(), 2);
    }

    #[test]
    fn test_bucket_never_wider_than_cooldown() {
        let config = CommandsConfig::default();
        assert_eq!(config.effective_bucket_secs(), 30);
        let config = CommandsConfig {
            cooldown_secs: 120,
            idempotency_bucket_secs: 60,
        };
        assert_eq!(config.effective_bucket_secs(), 60);
        let config = CommandsConfig {
            cooldown_secs: 0,
            idempotency_bucket_secs: 60,
        };
        assert_eq!(config.effective_bucket_secs(), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_rejected() {
        let (_dir, _clock, log) = command_log();
        assert!(matches!(
            log.dispatch(CommandVerb::Start, "ghost", "cli").await,
            Err(WardenError::UnknownWorker(_))
        ));
        assert!(log.dispatch(CommandVerb::Start, ALL_TARGET, "cli").await.unwrap().is_appended());
    }

    #[tokio::test]
    async fn test_take_pending_advances_cursor() {
        let (_dir, clock, log) = command_log();
        log.dispatch(CommandVerb::Restart, "feeder", "cli").await.unwrap();
        log.dispatch(CommandVerb::Restart, "trader", "cli").await.unwrap();

        let pending = log.take_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].target, "feeder");
        assert!(log.take_pending().await.unwrap().is_empty());

        clock.advance_secs(120);
        log.dispatch(CommandVerb::Stop, "feeder", "cli").await.unwrap();
        let pending = log.take_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].verb, CommandVerb::Stop);
    }
}
