//! Loads worker health records from the store and publishes the aggregated
//! snapshot.

use crate::domain::{from_epoch_secs, HealthRecord, SharedClock, SystemHealthSnapshot, Verdict};
use crate::error::{Result, WardenError};
use crate::health::aggregator;
use crate::health::contracts::ContractRegistry;
use crate::persistence::{keys, DurableStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// On-disk health record, as written by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    /// UTC epoch seconds; millisecond values are accepted
    #[serde(alias = "timestamp", alias = "ts")]
    pub last_ts: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthReport {
    /// Convert to a domain record. Unknown statuses and unusable timestamps
    /// are reported as FAILED.
    pub fn into_record(self, name: &str, ttl_seconds: u64) -> std::result::Result<HealthRecord, String> {
        let last_update = from_epoch_secs(self.last_ts)
            .ok_or_else(|| format!("invalid last_ts {}", self.last_ts))?;

        let (verdict, last_error) = match Verdict::parse_status(&self.status) {
            Some(v) => (v, self.last_error),
            None => (
                Verdict::Failed,
                Some(format!("unknown status '{}'", self.status)),
            ),
        };

        Ok(HealthRecord {
            name: name.to_string(),
            verdict,
            last_update,
            ttl_seconds,
            metrics: self.metrics,
            last_error,
        })
    }
}

/// Reads per-component records and runs the aggregator over them
#[derive(Debug, Clone)]
pub struct HealthReader {
    store: DurableStore,
    contracts: Arc<ContractRegistry>,
    clock: SharedClock,
}

impl HealthReader {
    pub fn new(store: DurableStore, contracts: Arc<ContractRegistry>, clock: SharedClock) -> Self {
        Self {
            store,
            contracts,
            clock,
        }
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    /// Load the record of one contracted component.
    ///
    /// A record that exists but cannot be decoded is surfaced as a fresh
    /// FAILED record so the aggregator treats it as the safest outcome.
    pub async fn load_record(&self, name: &str) -> Result<Option<HealthRecord>> {
        let ttl = self
            .contracts
            .ttl(name)
            .ok_or_else(|| WardenError::Validation(format!("no health contract for {name}")))?;

        match self.store.read_json::<HealthReport>(&keys::health(name)).await {
            Ok(report) => match report.into_record(name, ttl) {
                Ok(record) => Ok(Some(record)),
                Err(reason) => Ok(Some(self.unreadable(name, ttl, reason))),
            },
            Err(WardenError::NotFound(_)) => Ok(None),
            Err(WardenError::Json(e)) => {
                if let Some(suppressed) = self.store.read_error_permit("health", &keys::health(name)) {
                    warn!(component = name, error = %e, suppressed, "malformed health record");
                }
                Ok(Some(self.unreadable(name, ttl, format!("malformed health record: {e}"))))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn load_records(&self) -> Result<BTreeMap<String, HealthRecord>> {
        let mut records = BTreeMap::new();
        for name in self.contracts.names() {
            if let Some(record) = self.load_record(name).await? {
                records.insert(name.to_string(), record);
            }
        }
        Ok(records)
    }

    /// Compute a fresh snapshot without persisting it
    pub async fn snapshot(&self) -> Result<SystemHealthSnapshot> {
        let records = self.load_records().await?;
        Ok(aggregator::evaluate(&records, &self.contracts, self.clock.now()))
    }

    /// Compute and persist a snapshot for observers
    pub async fn refresh(&self) -> Result<SystemHealthSnapshot> {
        let snapshot = self.snapshot().await?;
        self.store.write_json(keys::SYSTEM_SNAPSHOT, &snapshot).await?;
        debug!(
            ready = snapshot.overall_ready,
            failing = ?snapshot.failing_components,
            "health snapshot published"
        );
        Ok(snapshot)
    }

    /// Last published snapshot, if any
    pub async fn published(&self) -> Option<SystemHealthSnapshot> {
        self.store.read_json(keys::SYSTEM_SNAPSHOT).await.ok()
    }

    fn unreadable(&self, name: &str, ttl: u64, reason: String) -> HealthRecord {
        let mut record = HealthRecord::new(name, Verdict::Failed, self.clock.now()).with_error(reason);
        record.ttl_seconds = ttl;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Clock, ManualClock, VerdictCause};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: DurableStore,
        clock: Arc<ManualClock>,
        reader: HealthReader,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let mut contracts = ContractRegistry::new();
        contracts.declare("feeder", 10, true).declare("trader", 30, true);
        let reader = HealthReader::new(store.clone(), Arc::new(contracts), clock.clone());
        Fixture {
            _dir: dir,
            store,
            clock,
            reader,
        }
    }

    #[tokio::test]
    async fn test_millisecond_timestamps_normalized() {
        let f = fixture();
        let now_ms = f.clock.epoch_secs() * 1000.0;
        f.store
            .write_json(
                "health/feeder.json",
                &json!({"status": "ok", "last_ts": now_ms, "metrics": {}}),
            )
            .await
            .unwrap();

        let record = f.reader.load_record("feeder").await.unwrap().unwrap();
        assert_eq!(record.last_update, f.clock.now());
        assert_eq!(record.ttl_seconds, 10);
    }

    #[tokio::test]
    async fn test_unknown_status_is_failed() {
        let f = fixture();
        f.store
            .write_json(
                "health/trader.json",
                &json!({"status": "meh", "last_ts": f.clock.epoch_secs()}),
            )
            .await
            .unwrap();

        let record = f.reader.load_record("trader").await.unwrap().unwrap();
        assert_eq!(record.verdict, Verdict::Failed);
        assert!(record.last_error.unwrap().contains("unknown status"));
    }

    #[tokio::test]
    async fn test_malformed_record_is_failed_not_error() {
        let f = fixture();
        f.store.write_text("health/feeder.json", "{not json").await.unwrap();

        let snapshot = f.reader.snapshot().await.unwrap();
        assert_eq!(snapshot.verdict_of("feeder"), Some(Verdict::Failed));
        assert!(matches!(
            snapshot.cause_of("feeder"),
            Some(VerdictCause::Reported { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_record_logged_once_across_cycles() {
        let f = fixture();
        f.store.write_text("health/feeder.json", "{not json").await.unwrap();
        for _ in 0..3 {
            f.reader.snapshot().await.unwrap();
            f.clock.advance_secs(5);
        }
        assert_eq!(f.store.read_errors_suppressed("health", "health/feeder.json"), 2);
    }

    #[tokio::test]
    async fn test_refresh_publishes_snapshot() {
        let f = fixture();
        let ts = f.clock.epoch_secs();
        for name in ["feeder", "trader"] {
            f.store
                .write_json(&keys::health(name), &json!({"status": "ok", "last_ts": ts}))
                .await
                .unwrap();
        }

        let snapshot = f.reader.refresh().await.unwrap();
        assert!(snapshot.overall_ready);
        let published = f.reader.published().await.unwrap();
        assert_eq!(published, snapshot);
    }

    #[tokio::test]
    async fn test_heartbeat_stops_goes_stale() {
        let f = fixture();
        let ts = f.clock.epoch_secs();
        for name in ["feeder", "trader"] {
            f.store
                .write_json(&keys::health(name), &json!({"status": "ok", "last_ts": ts}))
                .await
                .unwrap();
        }
        assert!(f.reader.snapshot().await.unwrap().overall_ready);

        f.clock.advance_secs(11);
        let snapshot = f.reader.snapshot().await.unwrap();
        assert_eq!(snapshot.failing_components.len(), 1);
        assert!(snapshot.is_failing("feeder"));
    }
}
