//! Single-Instance Guard
//!
//! One lock file per worker role under `locks/`. A lock whose recorded pid is
//! no longer alive is stale and is reclaimed on the next acquire.

use crate::domain::{LockRecord, SharedClock};
use crate::error::{Result, WardenError};
use crate::persistence::{keys, DurableStore};
use tracing::{debug, info, warn};

/// Is a process with this pid running?
///
/// Permission errors mean the process exists but belongs to someone else.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        // No cheap liveness check here; trust the lock file
        true
    }
}

/// Send SIGTERM (or SIGKILL when `force`). Returns whether the signal was delivered.
pub fn terminate_process(pid: u32, force: bool) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => true,
            Err(e) => {
                debug!(pid, error = %e, "signal not delivered");
                false
            }
        }
    }
    #[cfg(not(unix))]
    {
        warn!(pid, force, "process signals not supported on this platform");
        false
    }
}

/// Lock file contents. Older workers wrote a bare pid.
fn parse_lock(name: &str, text: &str) -> Option<LockRecord> {
    if let Ok(record) = serde_json::from_str::<LockRecord>(text) {
        return Some(record);
    }
    text.trim().parse::<u32>().ok().map(|pid| LockRecord {
        owner_name: name.to_string(),
        pid,
        acquired_at: chrono::DateTime::<chrono::Utc>::default(),
    })
}

#[derive(Debug, Clone)]
pub struct InstanceGuard {
    store: DurableStore,
    clock: SharedClock,
    pid: u32,
}

impl InstanceGuard {
    /// Guard acquiring on behalf of the current process
    pub fn new(store: DurableStore, clock: SharedClock) -> Self {
        Self::for_pid(store, clock, std::process::id())
    }

    /// Guard acquiring on behalf of another pid (a freshly launched worker)
    pub fn for_pid(store: DurableStore, clock: SharedClock, pid: u32) -> Self {
        Self { store, clock, pid }
    }

    /// Take the lock for `name`. False when a live process already holds it.
    pub async fn acquire(&self, name: &str) -> Result<bool> {
        let key = keys::lock(name);
        let record = LockRecord {
            owner_name: name.to_string(),
            pid: self.pid,
            acquired_at: self.clock.now(),
        };
        let bytes = serde_json::to_vec(&record)?;

        // Two rounds: the second follows removal of a stale lock
        for _ in 0..2 {
            if self.store.create_exclusive(&key, bytes.clone()).await? {
                info!(worker = name, pid = self.pid, "instance lock acquired");
                return Ok(true);
            }
            match self.holder_record(name).await {
                Some(existing) if existing.pid == self.pid => return Ok(true),
                Some(existing) if is_process_alive(existing.pid) => {
                    debug!(worker = name, pid = existing.pid, "lock held by live process");
                    return Ok(false);
                }
                _ => {
                    self.clear_stale(name).await?;
                }
            }
        }
        Ok(false)
    }

    /// Like [`acquire`](Self::acquire) but reports the holder as an error
    pub async fn acquire_or_fail(&self, name: &str) -> Result<()> {
        if self.acquire(name).await? {
            return Ok(());
        }
        let pid = self.holder(name).await.map(|h| h.pid).unwrap_or_default();
        Err(WardenError::AlreadyRunning {
            name: name.to_string(),
            pid,
        })
    }

    /// Release our lock. Idempotent; never removes a lock owned by another live pid.
    pub async fn release(&self, name: &str) -> Result<bool> {
        match self.holder_record(name).await {
            Some(existing) if existing.pid != self.pid && is_process_alive(existing.pid) => {
                warn!(
                    worker = name,
                    holder = existing.pid,
                    "not releasing lock held by another process"
                );
                Ok(false)
            }
            Some(_) => self.store.remove(&keys::lock(name)).await,
            None => self.store.remove(&keys::lock(name)).await,
        }
    }

    /// Operator removal regardless of holder
    pub async fn force_release(&self, name: &str) -> Result<bool> {
        let removed = self.store.remove(&keys::lock(name)).await?;
        if removed {
            warn!(worker = name, "instance lock force-released");
        }
        Ok(removed)
    }

    /// Live holder of the lock, if any
    pub async fn holder(&self, name: &str) -> Option<LockRecord> {
        self.holder_record(name)
            .await
            .filter(|record| is_process_alive(record.pid))
    }

    /// Remove the lock if its pid is dead or the file is unreadable.
    /// Returns whether anything was removed.
    pub async fn clear_stale(&self, name: &str) -> Result<bool> {
        let key = keys::lock(name);
        if !self.store.exists(&key).await {
            return Ok(false);
        }
        let stale = match self.holder_record(name).await {
            Some(record) => !is_process_alive(record.pid),
            None => true,
        };
        if !stale {
            return Ok(false);
        }
        let removed = self.store.remove(&key).await?;
        if removed {
            info!(worker = name, "removed stale instance lock");
        }
        Ok(removed)
    }

    async fn holder_record(&self, name: &str) -> Option<LockRecord> {
        let text = self.store.read_text(&keys::lock(name)).await.ok()?;
        parse_lock(name, &text)
    }
}
