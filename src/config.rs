//! Application Configuration
//!
//! Loaded from `config/<env>.yaml`. Every section except `log` has defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::LedgerError;
use crate::policy::StoragePolicy;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log: LogConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Write/read levels per operation class
    #[serde(default)]
    pub policy: StoragePolicy,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// `minutely`, `hourly`, `daily`, anything else never rotates
    pub rotation: String,
    /// Level overrides keyed by module path within this crate
    #[serde(default)]
    pub components: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "wallet_ledger.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            components: BTreeMap::new(),
        }
    }
}

/// Change watcher reconnect behavior
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Consecutive failed reconnects before the subscription goes fatal
    pub max_consecutive_failures: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Two-phase recovery and stale transaction sweep
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
    pub stale_transaction_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
            stale_transaction_secs: 3600,
        }
    }
}

/// PostgreSQL connection for the persisted cursor store
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self, LedgerError> {
        Self::from_file(format!("config/{env}.yaml"))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, LedgerError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        self.policy.validate()?;
        if self.recovery.scan_interval_secs == 0 {
            return Err(LedgerError::Config(
                "recovery.scan_interval_secs must be positive".into(),
            ));
        }
        if self.recovery.batch_size == 0 {
            return Err(LedgerError::Config("recovery.batch_size must be positive".into()));
        }
        if self.watcher.backoff_multiplier < 1.0 {
            return Err(LedgerError::Config(
                "watcher.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Acknowledgement, ReadLevel};

    const MINIMAL: &str = r#"
log:
  log_level: debug
  log_dir: ./logs
  log_file: ledger.log
  use_json: true
  rotation: hourly
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.log.log_level, "debug");
        assert!(config.log.components.is_empty());
        assert_eq!(config.watcher, WatcherConfig::default());
        assert_eq!(config.recovery, RecoveryConfig::default());
        assert_eq!(config.policy, StoragePolicy::default());
        assert_eq!(config.database.url, None);
    }

    #[test]
    fn test_sections_override() {
        let yaml = format!(
            "{MINIMAL}
watcher:
  max_consecutive_failures: 3
recovery:
  stale_threshold_secs: 5
database:
  url: postgresql://ledger@localhost/ledger
"
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.watcher.max_consecutive_failures, 3);
        assert_eq!(config.watcher.initial_backoff_ms, 100);
        assert_eq!(config.recovery.stale_threshold_secs, 5);
        assert_eq!(config.recovery.batch_size, 100);
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgresql://ledger@localhost/ledger")
        );
    }

    #[test]
    fn test_weak_financial_policy_rejected() {
        let yaml = format!(
            "{MINIMAL}
policy:
  consistency:
    financial: secondary_preferred
"
        );
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert_eq!(ReadLevel::Primary, StoragePolicy::default().consistency.financial);
        assert_eq!(
            StoragePolicy::default().durability.financial.ack,
            Acknowledgement::Majority
        );
    }

    #[test]
    fn test_zero_scan_interval_rejected() {
        let yaml = format!("{MINIMAL}\nrecovery:\n  scan_interval_secs: 0\n");
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_dev_config_loads() {
        let config = AppConfig::load("dev").unwrap();
        assert_eq!(config.policy, StoragePolicy::default());
        assert_eq!(config.recovery, RecoveryConfig::default());
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::from_file("config/does-not-exist.yaml").unwrap_err();
        assert!(err.to_string().contains("does-not-exist"));
    }
}
