//! Durable Store
//!
//! Keyed JSON/text records and append-only NDJSON logs on the local
//! filesystem. Writes go to a unique temp file in the target directory,
//! are fsynced, then renamed over the target so readers only ever see the
//! old or the new value.

use crate::error::{Result, WardenError};
use crate::logging::ErrorThrottle;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the durable store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the shared state tree
    pub root: PathBuf,
    /// Maximum attempts for one atomic write (default: 5)
    pub write_attempts: u32,
    /// Base delay for write retry backoff (default: 10ms)
    pub write_backoff_base_ms: u64,
    /// Maximum attempts for a tolerant read (default: 3)
    pub read_attempts: u32,
    /// Delay between tolerant read attempts (default: 25ms)
    pub read_retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            write_attempts: 5,
            write_backoff_base_ms: 10,
            read_attempts: 3,
            read_retry_delay_ms: 25,
        }
    }
}

impl StoreConfig {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    fn write_backoff(&self, attempt: u32) -> Duration {
        let base = self
            .write_backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if self.write_backoff_base_ms > 0 {
            rand::thread_rng().gen_range(0..self.write_backoff_base_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

fn default_store_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("warden"))
        .unwrap_or_else(|| PathBuf::from("state"))
}

/// Handle to the shared on-disk state tree
#[derive(Debug, Clone)]
pub struct DurableStore {
    config: Arc<StoreConfig>,
    read_errors: Arc<ErrorThrottle>,
}

impl DurableStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config: Arc::new(config),
            read_errors: Arc::new(ErrorThrottle::with_defaults()),
        }
    }

    /// Store rooted at `root` with default retry settings
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(StoreConfig::at(root))
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Gate for logging a failed read of `key` by `subsystem`.
    ///
    /// Shared by every clone of this store, so a bad record is reported once
    /// per window no matter how many callers poll it. `Some(n)` means log now,
    /// with `n` reports swallowed since the last one.
    pub fn read_error_permit(&self, subsystem: &str, key: &str) -> Option<u64> {
        self.read_errors.permit(&format!("{subsystem}:{key}"))
    }

    pub fn read_errors_suppressed(&self, subsystem: &str, key: &str) -> u64 {
        self.read_errors.suppressed(&format!("{subsystem}:{key}"))
    }

    /// Resolve a key such as `health/feeder.json` to a path under the root.
    ///
    /// Keys are relative, `/`-separated, and may not escape the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
            return Err(WardenError::InvalidKey(key.to_string()));
        }
        let mut path = self.config.root.clone();
        for part in key.split('/') {
            let valid = !part.is_empty()
                && part != "."
                && part != ".."
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
            if !valid {
                return Err(WardenError::InvalidKey(key.to_string()));
            }
            path.push(part);
        }
        Ok(path)
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Atomically replace `key` with the JSON encoding of `value`
    pub async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        self.write_bytes(key, bytes).await
    }

    pub async fn write_text(&self, key: &str, text: &str) -> Result<()> {
        self.write_bytes(key, text.as_bytes().to_vec()).await
    }

    /// Atomically replace `key` with `bytes`.
    ///
    /// Temp-name collisions and transient permission/sharing errors are
    /// retried with a fresh temp name and exponential backoff. Anything else,
    /// or running out of attempts, yields `StoreWriteFailed`.
    pub async fn write_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.write_bytes_with(key, bytes, write_atomic_blocking).await
    }

    async fn write_bytes_with(
        &self,
        key: &str,
        bytes: Vec<u8>,
        writer: fn(&Path, &[u8]) -> std::io::Result<()>,
    ) -> Result<()> {
        let target = self.path_for(key)?;
        let bytes = Arc::new(bytes);
        let attempts = self.config.write_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let target_clone = target.clone();
            let bytes_clone = Arc::clone(&bytes);
            let outcome = tokio::task::spawn_blocking(move || {
                writer(&target_clone, &bytes_clone)
            })
            .await
            .map_err(|e| WardenError::Internal(format!("store writer task failed: {e}")))?;

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < attempts => {
                    let delay = self.config.write_backoff(attempt);
                    debug!(
                        key,
                        attempt,
                        error = %e,
                        "transient store write failure, retrying in {:?}",
                        delay
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(WardenError::StoreWriteFailed {
                        key: key.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(WardenError::StoreWriteFailed {
            key: key.to_string(),
            attempts,
            reason: last_error,
        })
    }

    /// Read and decode `key`. Missing keys yield `NotFound`; a value that
    /// fails to decode is re-read a few times before the decode error is
    /// returned, to ride out a writer caught mid-flight on non-atomic
    /// filesystems.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let path = self.path_for(key)?;
        let attempts = self.config.read_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(WardenError::NotFound(key.to_string()))
                }
                Err(e) if attempt < attempts => {
                    debug!(key, attempt, error = %e, "store read failed, retrying");
                    self.read_pause().await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    debug!(key, attempt, error = %e, "store record did not parse, retrying");
                    self.read_pause().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Tolerant read: any failure, including a missing key, yields `default`
    pub async fn read_json_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.read_json(key).await {
            Ok(value) => value,
            Err(WardenError::NotFound(_)) => default,
            Err(e) => {
                if let Some(suppressed) = self.read_error_permit("store", key) {
                    warn!(key, error = %e, suppressed, "unreadable store record, using default");
                }
                default
            }
        }
    }

    pub async fn read_text(&self, key: &str) -> Result<String> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(WardenError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `key`. Returns whether anything was removed; a missing key is not an error.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `key` only if it does not already exist.
    ///
    /// The bytes are written to a temp file first and hard-linked into place,
    /// so a contender never observes a partially written record. Returns
    /// `false` when another writer got there first.
    pub async fn create_exclusive(&self, key: &str, bytes: Vec<u8>) -> Result<bool> {
        let path = self.path_for(key)?;
        tokio::task::spawn_blocking(move || create_exclusive_blocking(&path, &bytes))
            .await
            .map_err(|e| WardenError::Internal(format!("store writer task failed: {e}")))?
            .map_err(WardenError::from)
    }

    /// Append one JSON line to an ordered log.
    ///
    /// The line is written with a single `write` on an `O_APPEND` handle and
    /// synced before returning, so prior entries are never disturbed. A torn
    /// tail left by a crashed writer is terminated first so the new entry
    /// starts on its own line.
    pub async fn append_json<T: Serialize + ?Sized>(&self, log_key: &str, entry: &T) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let path = self.path_for(log_key)?;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .create(true)
                .append(true)
                .open(&path)?;
            if ends_mid_line(&mut file)? {
                line.insert(0, b'\n');
            }
            file.write_all(&line)?;
            file.sync_data()
        })
        .await
        .map_err(|e| WardenError::Internal(format!("store append task failed: {e}")))?
        .map_err(WardenError::from)
    }

    /// Read every decodable entry of a log, in order.
    ///
    /// A torn trailing line left by a crash is skipped.
    pub async fn read_log<T: DeserializeOwned>(&self, log_key: &str) -> Result<Vec<T>> {
        let text = match self.read_text(log_key).await {
            Ok(text) => text,
            Err(WardenError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!(log_key, line = lineno + 1, error = %e, "skipping undecodable log line"),
            }
        }
        Ok(entries)
    }

    async fn read_pause(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.read_retry_delay_ms)).await;
    }
}

fn write_atomic_blocking(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "key has no parent directory"))?;
    std::fs::create_dir_all(dir)?;

    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = dir.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, target)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
        return result;
    }

    #[cfg(unix)]
    {
        // Persist the rename itself; losing this only costs durability, not atomicity.
        if let Ok(handle) = std::fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }

    Ok(())
}

fn create_exclusive_blocking(target: &Path, bytes: &[u8]) -> std::io::Result<bool> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "key has no parent directory"))?;
    std::fs::create_dir_all(dir)?;
    if target.exists() {
        return Ok(false);
    }

    let tmp = dir.join(format!(
        ".{}.{}.excl.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    let linked = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        // link(2) fails if the target exists: a no-clobber publish
        match std::fs::hard_link(&tmp, target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    })();
    let _ = std::fs::remove_file(&tmp);
    linked
}

/// Whether a log file's last byte is something other than a newline
fn ends_mid_line(file: &mut std::fs::File) -> std::io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::AlreadyExists
            | ErrorKind::PermissionDenied
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, DurableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, store) = temp_store();
        store
            .write_json("health/feeder.json", &json!({"status": "ok"}))
            .await
            .unwrap();
        let value: serde_json::Value = store.read_json("health/feeder.json").await.unwrap();
        assert_eq!(value["status"], "ok");
        assert!(store.exists("health/feeder.json").await);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (_dir, store) = temp_store();
        let err = store
            .read_json::<serde_json::Value>("nope.json")
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_torn_file_falls_back_to_default() {
        let (dir, store) = temp_store();
        std::fs::write(dir.path().join("breaker.json"), b"{\"state\": \"OP").unwrap();
        let value = store
            .read_json_or("breaker.json", json!({"fallback": true}))
            .await;
        assert_eq!(value["fallback"], true);

        store.read_json_or("breaker.json", json!({})).await;
        assert_eq!(store.read_errors_suppressed("store", "breaker.json"), 1);
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let (_dir, store) = temp_store();
        for key in ["", "/etc/passwd", "../escape", "a//b", "a/../b", "dir/", "sp ace"] {
            assert!(
                matches!(store.path_for(key), Err(WardenError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
        assert!(store.path_for("locks/feeder.pid").is_ok());
        assert!(store.path_for("STOP.TXT").is_ok());
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let (dir, store) = temp_store();
        for i in 0..5 {
            store.write_json("controls/state.json", &json!({"i": i})).await.unwrap();
        }
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("controls"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_append_preserves_order_and_skips_torn_tail() {
        let (dir, store) = temp_store();
        for i in 0..3 {
            store.append_json("logs/events.jsonl", &json!({"seq": i})).await.unwrap();
        }
        // Simulate a crash mid-append
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("logs/events.jsonl"))
            .unwrap();
        file.write_all(b"{\"seq\": 3").unwrap();

        let entries: Vec<serde_json::Value> = store.read_log("logs/events.jsonl").await.unwrap();
        let seqs: Vec<i64> = entries.iter().map(|e| e["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_read_log_missing_is_empty() {
        let (_dir, store) = temp_store();
        let entries: Vec<serde_json::Value> = store.read_log("logs/none.jsonl").await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_create_exclusive() {
        let (_dir, store) = temp_store();
        assert!(store.create_exclusive("locks/a.pid", b"1".to_vec()).await.unwrap());
        assert!(!store.create_exclusive("locks/a.pid", b"2".to_vec()).await.unwrap());
        assert_eq!(store.read_text("locks/a.pid").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_dir, store) = temp_store();
        store.write_text("STOP.TXT", "stop").await.unwrap();
        assert!(store.remove("STOP.TXT").await.unwrap());
        assert!(!store.remove("STOP.TXT").await.unwrap());
    }

    #[tokio::test]
    async fn test_append_after_torn_tail_keeps_new_entry() {
        let (dir, store) = temp_store();
        store.append_json("commands/commands.jsonl", &json!({"seq": 0})).await.unwrap();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("commands/commands.jsonl"))
            .unwrap();
        file.write_all(b"{\"seq\": 1").unwrap();
        drop(file);

        store.append_json("commands/commands.jsonl", &json!({"seq": 2})).await.unwrap();
        store.append_json("commands/commands.jsonl", &json!({"seq": 3})).await.unwrap();

        let entries: Vec<serde_json::Value> = store.read_log("commands/commands.jsonl").await.unwrap();
        let seqs: Vec<i64> = entries.iter().map(|e| e["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn test_create_exclusive_contenders_never_see_partial_record() {
        let (dir, store) = temp_store();
        let payload = |i: usize| format!("{{\"pid\": {i}, \"pad\": \"{}\"}}", "x".repeat(4096));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let won = store
                    .create_exclusive("locks/feeder.lock", payload(i).into_bytes())
                    .await
                    .unwrap();
                // Whoever lost must find a complete record
                if !won {
                    let text = store.read_text("locks/feeder.lock").await.unwrap();
                    serde_json::from_str::<serde_json::Value>(&text).unwrap();
                }
                (i, won)
            }));
        }
        let mut winners = Vec::new();
        for task in tasks {
            let (i, won) = task.await.unwrap();
            if won {
                winners.push(i);
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(
            store.read_text("locks/feeder.lock").await.unwrap(),
            payload(winners[0])
        );
        let leftovers = std::fs::read_dir(dir.path().join("locks"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    fn always_denied(_target: &Path, _bytes: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::new(ErrorKind::PermissionDenied, "sharing violation"))
    }

    static FLAKY_CALLS: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

    fn denied_once(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if FLAKY_CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
            return Err(std::io::Error::new(ErrorKind::AlreadyExists, "temp name taken"));
        }
        write_atomic_blocking(target, bytes)
    }

    #[tokio::test]
    async fn test_transient_write_errors_are_retried_then_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::new(StoreConfig {
            write_attempts: 2,
            write_backoff_base_ms: 1,
            ..StoreConfig::at(dir.path())
        });

        let err = store
            .write_bytes_with("breaker.json", b"{}".to_vec(), always_denied)
            .await
            .unwrap_err();
        match err {
            WardenError::StoreWriteFailed { key, attempts, reason } => {
                assert_eq!(key, "breaker.json");
                assert_eq!(attempts, 2);
                assert!(reason.contains("sharing violation"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.exists("breaker.json").await);

        store
            .write_bytes_with("breaker.json", b"{\"state\": \"CLOSED\"}".to_vec(), denied_once)
            .await
            .unwrap();
        let value: serde_json::Value = store.read_json("breaker.json").await.unwrap();
        assert_eq!(value["state"], "CLOSED");
    }

    #[tokio::test]
    async fn test_non_transient_write_error_fails_fast() {
        let (dir, store) = temp_store();
        // A file where a directory should be
        std::fs::write(dir.path().join("health"), b"not a dir").unwrap();
        let err = store
            .write_json("health/nested/feeder.json", &json!({"status": "ok"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::StoreWriteFailed { attempts: 1, .. }));
    }

    #[test]
    fn test_write_backoff_grows() {
        let config = StoreConfig {
            write_backoff_base_ms: 10,
            ..StoreConfig::at("/tmp")
        };
        let first = config.write_backoff(1);
        let third = config.write_backoff(3);
        assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(20));
        assert!(third >= Duration::from_millis(40) && third < Duration::from_millis(50));
    }
}
