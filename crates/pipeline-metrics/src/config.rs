use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cost::PricingTable;
use crate::error::ConfigError;
use crate::rollup::Granularity;

pub const CONFIG_FILE_PATH: &str = "pipeline-metrics.toml";

pub const ENV_PERSISTENT: &str = "PIPELINE_METRICS_PERSISTENT";
pub const ENV_DB_PATH: &str = "PIPELINE_METRICS_DB_PATH";
pub const ENV_BUS_CAPACITY: &str = "PIPELINE_METRICS_BUS_CAPACITY";
pub const ENV_DEFAULT_MODEL: &str = "PIPELINE_METRICS_DEFAULT_MODEL";
pub const ENV_PROMETHEUS: &str = "PIPELINE_METRICS_PROMETHEUS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Write snapshots and rollups to storage; logging only when off.
    pub persistent_enabled: bool,
    /// Also observe snapshots into Prometheus histograms.
    pub prometheus_enabled: bool,
    /// SQLite database file. In-memory storage when unset.
    pub db_path: Option<PathBuf>,
    pub bus_capacity: usize,
    pub granularities: Vec<Granularity>,
    /// Model billed when a pipeline never reports one.
    pub default_model: String,
    pub pricing: PricingTable,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            persistent_enabled: true,
            prometheus_enabled: false,
            db_path: None,
            bus_capacity: 1024,
            granularities: Granularity::ALL.to_vec(),
            default_model: "gpt-4o-mini".to_string(),
            pricing: PricingTable::default(),
        }
    }
}

pub fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl MetricsConfig {
    /// `pipeline-metrics.toml` in the working directory when present, then
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Path::new(CONFIG_FILE_PATH);
        let config = if path.exists() {
            Self::from_path(path)?
        } else {
            Self::default()
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PIPELINE_METRICS_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_PERSISTENT) {
            self.persistent_enabled = parse_bool_env(&value);
        }
        if let Some(value) = lookup(ENV_PROMETHEUS) {
            self.prometheus_enabled = parse_bool_env(&value);
        }
        if let Some(value) = lookup(ENV_DB_PATH) {
            let value = value.trim();
            self.db_path = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_BUS_CAPACITY) {
            self.bus_capacity = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_BUS_CAPACITY.to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_DEFAULT_MODEL) {
            self.default_model = value.trim().to_string();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "bus_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        if self.default_model.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "default_model".to_string(),
                value: String::new(),
            });
        }
        self.pricing.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_bool_env_true_values() {
        for value in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert!(parse_bool_env(value), "value {value:?} should be true");
        }
    }

    #[test]
    fn parse_bool_env_false_values() {
        for value in ["0", "false", "no", "off", "", "  "] {
            assert!(!parse_bool_env(value), "value {value:?} should be false");
        }
    }

    #[test]
    fn toml_fields_override_defaults() {
        let config = MetricsConfig::from_toml_str(
            r#"
            persistent_enabled = false
            prometheus_enabled = true
            granularities = ["hour", "day"]

            [pricing]
            credits_per_dollar = 100.0

            [pricing.models."house-model"]
            input_per_million = 1.0
            output_per_million = 2.0
            "#,
        )
        .expect("parse config");

        assert!(!config.persistent_enabled);
        assert!(config.prometheus_enabled);
        assert_eq!(config.granularities, vec![Granularity::Hour, Granularity::Day]);
        assert_eq!(config.bus_capacity, 1024);
        assert_eq!(config.pricing.credits_per_dollar, 100.0);
        assert_eq!(config.pricing.price_for("house-model").output_per_million, 2.0);
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = MetricsConfig::default()
            .with_overrides(env(&[
                (ENV_PERSISTENT, "off"),
                (ENV_DB_PATH, "/tmp/metrics.db"),
                (ENV_BUS_CAPACITY, "64"),
                (ENV_DEFAULT_MODEL, "gpt-5-mini"),
                (ENV_PROMETHEUS, "yes"),
            ]))
            .expect("overrides");

        assert!(!config.persistent_enabled);
        assert!(config.prometheus_enabled);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/metrics.db")));
        assert_eq!(config.bus_capacity, 64);
        assert_eq!(config.default_model, "gpt-5-mini");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(MetricsConfig::default()
            .with_overrides(env(&[(ENV_BUS_CAPACITY, "lots")]))
            .is_err());
        assert!(MetricsConfig::default()
            .with_overrides(env(&[(ENV_BUS_CAPACITY, "0")]))
            .is_err());
        assert!(MetricsConfig::from_toml_str("[pricing]\ntts_price_per_100ms = -1.0\n").is_err());
    }

    #[test]
    fn from_path_reads_a_config_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join(CONFIG_FILE_PATH);
        std::fs::write(&path, "db_path = \"metrics.db\"\n").expect("write config");

        let config = MetricsConfig::from_path(&path).expect("load config");
        assert_eq!(config.db_path, Some(PathBuf::from("metrics.db")));

        assert!(matches!(
            MetricsConfig::from_path(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
