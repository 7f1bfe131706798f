use crate::domain::{SharedClock, Verdict};
use crate::error::Result;
use crate::health::reader::HealthReport;
use crate::persistence::{keys, DurableStore};
use serde_json::Value;
use std::collections::BTreeMap;

/// Writes a component's own health record in the canonical format
#[derive(Debug, Clone)]
pub struct HealthPublisher {
    store: DurableStore,
    clock: SharedClock,
    component: String,
}

impl HealthPublisher {
    pub fn new(store: DurableStore, clock: SharedClock, component: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub async fn publish(
        &self,
        verdict: Verdict,
        metrics: BTreeMap<String, Value>,
        last_error: Option<String>,
    ) -> Result<()> {
        let report = HealthReport {
            status: verdict.as_str().to_ascii_lowercase(),
            last_ts: self.clock.epoch_secs(),
            metrics,
            last_error,
        };
        self.store.write_json(&keys::health(&self.component), &report).await
    }

    /// Plain OK heartbeat
    pub async fn heartbeat(&self) -> Result<()> {
        self.publish(Verdict::Ok, BTreeMap::new(), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Clock, ManualClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publish_writes_canonical_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_123));
        let publisher = HealthPublisher::new(store.clone(), clock.clone(), "trader");

        let mut metrics = BTreeMap::new();
        metrics.insert("entrypoint_ok".to_string(), Value::Bool(true));
        publisher.publish(Verdict::Degraded, metrics, Some("slow".into())).await.unwrap();

        let report: HealthReport = store.read_json("health/trader.json").await.unwrap();
        assert_eq!(report.status, "degraded");
        assert_eq!(report.last_ts, clock.epoch_secs());
        assert_eq!(report.metrics["entrypoint_ok"], Value::Bool(true));
        assert_eq!(report.last_error.as_deref(), Some("slow"));
    }
}
