//! Static freshness contracts: how old a component's last report may be
//! before it is considered stale, and whether it gates system readiness.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Freshness contract for one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractConfig {
    /// Maximum tolerated age of the last report, in seconds
    pub ttl_seconds: u64,
    /// Whether the component gates `overall_ready` (default: true)
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Health aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between aggregation cycles (default: 2s)
    pub interval_secs: u64,
    /// Declared contracts, keyed by component name
    pub contracts: BTreeMap<String, ContractConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let mut contracts = BTreeMap::new();
        contracts.insert(
            "feeder".to_string(),
            ContractConfig {
                ttl_seconds: 10,
                required: true,
            },
        );
        contracts.insert(
            "signal".to_string(),
            ContractConfig {
                ttl_seconds: 30,
                required: true,
            },
        );
        contracts.insert(
            "trader".to_string(),
            ContractConfig {
                ttl_seconds: 30,
                required: true,
            },
        );
        contracts.insert(
            "user_stream".to_string(),
            ContractConfig {
                ttl_seconds: 50,
                required: true,
            },
        );
        contracts.insert(
            "autoheal".to_string(),
            ContractConfig {
                ttl_seconds: 30,
                required: false,
            },
        );
        Self {
            interval_secs: 2,
            contracts,
        }
    }
}

/// A component's contract, resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthContract {
    pub name: String,
    pub ttl_seconds: u64,
    pub required: bool,
}

/// The single source of truth for component TTLs
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, HealthContract>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        let mut registry = Self::new();
        for (name, contract) in &config.contracts {
            registry.declare(name, contract.ttl_seconds, contract.required);
        }
        registry
    }

    pub fn declare(&mut self, name: &str, ttl_seconds: u64, required: bool) -> &mut Self {
        self.contracts.insert(
            name.to_string(),
            HealthContract {
                name: name.to_string(),
                ttl_seconds,
                required,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&HealthContract> {
        self.contracts.get(name)
    }

    pub fn ttl(&self, name: &str) -> Option<u64> {
        self.contracts.get(name).map(|c| c.ttl_seconds)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HealthContract> {
        self.contracts.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_contracts() {
        let registry = ContractRegistry::from_config(&HealthConfig::default());
        assert_eq!(registry.ttl("feeder"), Some(10));
        assert_eq!(registry.ttl("user_stream"), Some(50));
        assert!(registry.get("trader").unwrap().required);
        assert!(!registry.get("autoheal").unwrap().required);
        assert_eq!(registry.ttl("unknown"), None);
    }

    #[test]
    fn test_required_defaults_to_true() {
        let contract: ContractConfig = toml::from_str("ttl_seconds = 5").unwrap();
        assert!(contract.required);
    }
}
