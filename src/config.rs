use crate::coordination::{BreakerConfig, CommandsConfig, OverrideConfig};
use crate::health::{ContractRegistry, HealthConfig};
use crate::persistence::StoreConfig;
use crate::supervisor::{AlertManagerConfig, AutoHealConfig, WorkerConfig};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub autoheal: AutoHealConfig,
    /// Supervised workers, keyed by role name
    pub workers: BTreeMap<String, WorkerConfig>,
    #[serde(rename = "override")]
    pub manual_override: OverrideConfig,
    pub commands: CommandsConfig,
    pub alerts: AlertManagerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (WARDEN_STORE__ROOT, etc.)
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Contracts declared under `[health.contracts]`
    pub fn contracts(&self) -> ContractRegistry {
        ContractRegistry::from_config(&self.health)
    }

    /// Effective configuration rendered as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.store.write_attempts == 0 {
            errors.push("store.write_attempts must be at least 1".to_string());
        }
        if self.store.read_attempts == 0 {
            errors.push("store.read_attempts must be at least 1".to_string());
        }

        if self.health.interval_secs == 0 {
            errors.push("health.interval_secs must be positive".to_string());
        }
        for (name, contract) in &self.health.contracts {
            if contract.ttl_seconds == 0 {
                errors.push(format!("health.contracts.{name}.ttl_seconds must be positive"));
            }
        }

        if self.breaker.interval_secs == 0 {
            errors.push("breaker.interval_secs must be positive".to_string());
        }
        if self.breaker.daily_loss_limit_usd <= Decimal::ZERO {
            errors.push("breaker.daily_loss_limit_usd must be positive".to_string());
        }
        if self.breaker.auto_reset_interval_secs < self.breaker.recovery_timeout_secs {
            errors.push(
                "breaker.auto_reset_interval_secs should not be shorter than recovery_timeout_secs"
                    .to_string(),
            );
        }
        if !self.health.contracts.contains_key(&self.breaker.feeder_component) {
            errors.push(format!(
                "breaker.feeder_component '{}' has no health contract",
                self.breaker.feeder_component
            ));
        }

        if self.autoheal.max_attempts_per_window == 0 {
            errors.push("autoheal.max_attempts_per_window must be at least 1".to_string());
        }
        if self.autoheal.window_secs == 0 {
            errors.push("autoheal.window_secs must be positive".to_string());
        }
        if self.autoheal.escalate_after_failures == 0 {
            errors.push("autoheal.escalate_after_failures must be at least 1".to_string());
        }
        if self.autoheal.escalate_after_exhausted_windows == 0 {
            errors.push("autoheal.escalate_after_exhausted_windows must be at least 1".to_string());
        }
        if self.autoheal.backoff_base_secs > self.autoheal.backoff_max_secs {
            errors.push("autoheal.backoff_base_secs exceeds backoff_max_secs".to_string());
        }

        for (name, worker) in &self.workers {
            if name == crate::coordination::command_log::ALL_TARGET {
                errors.push("'all' is reserved and cannot name a worker".to_string());
            }
            if worker.program.trim().is_empty() {
                errors.push(format!("workers.{name}.program is empty"));
            }
            if !self.health.contracts.contains_key(name) {
                errors.push(format!("workers.{name} has no health contract"));
            }
        }

        if self.manual_override.default_ttl_secs == 0
            || self.manual_override.default_ttl_secs > self.manual_override.max_ttl_secs
        {
            errors.push("override.default_ttl_secs must be within (0, max_ttl_secs]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
