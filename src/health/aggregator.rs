//! Health aggregation
//!
//! Folds per-component records into a [`SystemHealthSnapshot`]. The stored
//! verdict of a record is never trusted as-is: freshness against the
//! component's contract is always re-checked.

use crate::domain::{HealthRecord, SystemHealthSnapshot, Verdict, VerdictCause};
use crate::health::contracts::ContractRegistry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Verdict for one component.
///
/// Precedence, highest first: missing, stale, reported FAILED, reported
/// DEGRADED, OK.
pub fn component_verdict(
    record: Option<&HealthRecord>,
    ttl_seconds: u64,
    now: DateTime<Utc>,
) -> (Verdict, Option<VerdictCause>) {
    let Some(record) = record else {
        return (Verdict::Failed, Some(VerdictCause::Missing));
    };

    let age = record.age_secs(now);
    if age > ttl_seconds as f64 {
        return (
            Verdict::Failed,
            Some(VerdictCause::Stale {
                age_seconds: age,
                ttl_seconds,
            }),
        );
    }

    match record.verdict {
        Verdict::Failed => (
            Verdict::Failed,
            Some(VerdictCause::Reported {
                reason: record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "reported failed".to_string()),
            }),
        ),
        Verdict::Degraded => (
            Verdict::Degraded,
            Some(VerdictCause::Degraded {
                reason: record.last_error.clone(),
            }),
        ),
        Verdict::Ok => (Verdict::Ok, None),
    }
}

/// Evaluate every contracted component. Records without a contract are ignored.
pub fn evaluate(
    records: &BTreeMap<String, HealthRecord>,
    contracts: &ContractRegistry,
    now: DateTime<Utc>,
) -> SystemHealthSnapshot {
    let mut per_component = BTreeMap::new();
    let mut causes = BTreeMap::new();
    let mut failing = BTreeSet::new();

    for contract in contracts.iter() {
        let record = records.get(&contract.name);
        let (verdict, cause) = component_verdict(record, contract.ttl_seconds, now);

        if contract.required && !verdict.is_ok() {
            failing.insert(contract.name.clone());
        }

        let mut evaluated = match record {
            Some(r) => r.clone(),
            None => HealthRecord::new(contract.name.clone(), verdict, DateTime::<Utc>::default()),
        };
        evaluated.name = contract.name.clone();
        evaluated.verdict = verdict;
        evaluated.ttl_seconds = contract.ttl_seconds;
        if let Some(cause) = &cause {
            if evaluated.last_error.is_none() || cause.is_freshness() {
                evaluated.last_error = Some(cause.to_string());
            }
            causes.insert(contract.name.clone(), cause.clone());
        }
        per_component.insert(contract.name.clone(), evaluated);
    }

    SystemHealthSnapshot {
        timestamp: now,
        overall_ready: failing.is_empty(),
        failing_components: failing,
        per_component,
        causes,
    }
}
