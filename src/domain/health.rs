use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Tri-state component verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Ok,
    Degraded,
    Failed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Ok => "OK",
            Verdict::Degraded => "DEGRADED",
            Verdict::Failed => "FAILED",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }

    /// Parse a status string as reported by a worker.
    ///
    /// Workers are not consistent about vocabulary, so common synonyms are
    /// accepted. Returns `None` for anything unrecognised.
    pub fn parse_status(status: &str) -> Option<Verdict> {
        match status.trim().to_ascii_lowercase().as_str() {
            "ok" | "healthy" | "green" | "running" | "up" => Some(Verdict::Ok),
            "degraded" | "warn" | "warning" | "yellow" => Some(Verdict::Degraded),
            "failed" | "fail" | "error" | "red" | "down" | "unhealthy" => Some(Verdict::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health of one named component, as consumed by the aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub name: String,
    pub verdict: Verdict,
    pub last_update: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl HealthRecord {
    pub fn new(name: impl Into<String>, verdict: Verdict, last_update: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            verdict,
            last_update,
            ttl_seconds: 0,
            metrics: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        crate::domain::clock::seconds_between(self.last_update, now)
    }

    pub fn metric_f64(&self, key: &str) -> Option<f64> {
        match self.metrics.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn metric_bool(&self, key: &str) -> Option<bool> {
        match self.metrics.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Why a component did not get an OK verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerdictCause {
    Missing,
    Stale { age_seconds: f64, ttl_seconds: u64 },
    Reported { reason: String },
    Degraded { reason: Option<String> },
}

impl VerdictCause {
    pub fn is_freshness(&self) -> bool {
        matches!(self, VerdictCause::Missing | VerdictCause::Stale { .. })
    }
}

impl fmt::Display for VerdictCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictCause::Missing => write!(f, "missing"),
            VerdictCause::Stale {
                age_seconds,
                ttl_seconds,
            } => write!(f, "stale (age {:.1}s > ttl {}s)", age_seconds, ttl_seconds),
            VerdictCause::Reported { reason } => write!(f, "reported failed: {}", reason),
            VerdictCause::Degraded { reason: Some(r) } => write!(f, "degraded: {}", r),
            VerdictCause::Degraded { reason: None } => write!(f, "degraded"),
        }
    }
}

/// System-wide health, rebuilt wholesale on every aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub overall_ready: bool,
    pub failing_components: BTreeSet<String>,
    pub per_component: BTreeMap<String, HealthRecord>,
    #[serde(default)]
    pub causes: BTreeMap<String, VerdictCause>,
}

impl SystemHealthSnapshot {
    pub fn verdict_of(&self, name: &str) -> Option<Verdict> {
        self.per_component.get(name).map(|r| r.verdict)
    }

    pub fn cause_of(&self, name: &str) -> Option<&VerdictCause> {
        self.causes.get(name)
    }

    pub fn is_failing(&self, name: &str) -> bool {
        self.failing_components.contains(name)
    }

    pub fn record(&self, name: &str) -> Option<&HealthRecord> {
        self.per_component.get(name)
    }

    /// Sum a numeric metric across every component that reports it
    pub fn metric_sum(&self, key: &str) -> f64 {
        self.per_component
            .values()
            .filter_map(|r| r.metric_f64(key))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_synonyms() {
        assert_eq!(Verdict::parse_status("OK"), Some(Verdict::Ok));
        assert_eq!(Verdict::parse_status(" healthy "), Some(Verdict::Ok));
        assert_eq!(Verdict::parse_status("warn"), Some(Verdict::Degraded));
        assert_eq!(Verdict::parse_status("RED"), Some(Verdict::Failed));
        assert_eq!(Verdict::parse_status("banana"), None);
    }

    #[test]
    fn test_verdict_serde_uppercase() {
        let json = serde_json::to_string(&Verdict::Degraded).unwrap();
        assert_eq!(json, "\"DEGRADED\"");
    }

    #[test]
    fn test_metric_accessors() {
        let record = HealthRecord::new("trader", Verdict::Ok, Utc::now())
            .with_metric("entrypoint_ok", true)
            .with_metric("realized_pnl_today", "-12.5")
            .with_metric("schema_violations", 2);

        assert_eq!(record.metric_bool("entrypoint_ok"), Some(true));
        assert_eq!(record.metric_f64("realized_pnl_today"), Some(-12.5));
        assert_eq!(record.metric_f64("schema_violations"), Some(2.0));
        assert_eq!(record.metric_f64("missing"), None);
    }

    #[test]
    fn test_cause_display() {
        let cause = VerdictCause::Stale {
            age_seconds: 25.0,
            ttl_seconds: 10,
        };
        assert_eq!(cause.to_string(), "stale (age 25.0s > ttl 10s)");
        assert!(cause.is_freshness());
    }
}
