// Evolution Configuration
//
// Defines configuration for the background graph jobs: learning-rate
// parameters for edge learning, tiering pagination, per-job schedules and
// the storage deadline applied to every round trip.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main evolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Edge learning parameters
    #[serde(default)]
    pub learning: LearningConfig,

    /// Tier rebalancing parameters
    #[serde(default)]
    pub tiering: TieringConfig,

    /// Edge learning job schedule
    #[serde(default = "default_edge_learning_job")]
    pub edge_learning: JobConfig,

    /// Tier rebalance job schedule
    #[serde(default = "default_rebalance_job")]
    pub rebalance: JobConfig,

    /// Deadline for every individual storage round trip (in seconds)
    #[serde(with = "serde_duration", default = "default_storage_timeout")]
    pub storage_timeout: Duration,
}

/// EMA parameters for edge weight learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// EMA smoothing rate
    pub eta: f64,

    /// Reward applied for an accepted pack
    pub reward: f64,

    /// Penalty applied for a rejected pack
    pub penalty: f64,

    /// Upper bound for any edge weight
    pub w_max: f64,

    /// Event lookback window
    pub window_hours: u32,

    /// Top-M neighbors kept per tag
    pub max_edges_per_tag: usize,

    /// Attempts per edge update when a concurrent writer wins the race
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
}

/// Tier rebalancing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Tags fetched per metrics page
    pub page_size: usize,
}

/// When a job fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Fixed cadence from the end of the previous run
    Interval {
        #[serde(with = "serde_duration")]
        every: Duration,
    },

    /// Once a day at the given UTC wall-clock time
    Daily { hour: u32, minute: u32 },
}

/// Configuration for individual evolution jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Enable/disable this specific job
    pub enabled: bool,

    /// Trigger cadence
    pub schedule: Schedule,

    /// Maximum duration for job execution (in seconds)
    #[serde(with = "serde_duration")]
    pub max_duration: Duration,
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

fn default_max_write_retries() -> u32 {
    5
}

fn default_storage_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_edge_learning_job() -> JobConfig {
    JobConfig {
        enabled: true,
        schedule: Schedule::Interval {
            every: Duration::from_secs(600), // 10 minutes
        },
        max_duration: Duration::from_secs(540), // 9 minutes
    }
}

fn default_rebalance_job() -> JobConfig {
    JobConfig {
        enabled: true,
        schedule: Schedule::Daily { hour: 2, minute: 0 },
        max_duration: Duration::from_secs(3600), // 1 hour
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            eta: 0.05,
            reward: 0.03,
            penalty: 0.01,
            w_max: 1.0,
            window_hours: 24,
            max_edges_per_tag: 32,
            max_write_retries: default_max_write_retries(),
        }
    }
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            learning: LearningConfig::default(),
            tiering: TieringConfig::default(),
            edge_learning: default_edge_learning_job(),
            rebalance: default_rebalance_job(),
            storage_timeout: default_storage_timeout(),
        }
    }
}

impl EvolutionConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EvolutionConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MME_*` environment overrides on top of the loaded values
    ///
    /// Unset variables leave the current value alone; set but unparseable
    /// variables are an error rather than a silent fallback.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        override_from_env("MME_LEARN_ETA", &mut self.learning.eta)?;
        override_from_env("MME_LEARN_R", &mut self.learning.reward)?;
        override_from_env("MME_LEARN_D", &mut self.learning.penalty)?;
        override_from_env("MME_LEARN_WMAX", &mut self.learning.w_max)?;
        override_from_env("MME_LEARN_WINDOW_HOURS", &mut self.learning.window_hours)?;
        override_from_env("MME_MAX_EDGES_PER_TAG", &mut self.learning.max_edges_per_tag)?;
        override_from_env("MME_REBALANCE_PAGE_SIZE", &mut self.tiering.page_size)?;
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.learning;

        if !(l.eta > 0.0 && l.eta <= 1.0) {
            return Err(ConfigError::ValidationError(
                "learning.eta must be in (0, 1]".to_string(),
            ));
        }

        if !(l.reward >= 0.0 && l.penalty >= 0.0) {
            return Err(ConfigError::ValidationError(
                "learning.reward and learning.penalty must be non-negative".to_string(),
            ));
        }

        if !(l.w_max > 0.0 && l.w_max.is_finite()) {
            return Err(ConfigError::ValidationError(
                "learning.w_max must be a positive finite number".to_string(),
            ));
        }

        if l.window_hours == 0 {
            return Err(ConfigError::ValidationError(
                "learning.window_hours must be at least 1".to_string(),
            ));
        }

        if l.max_edges_per_tag == 0 {
            return Err(ConfigError::ValidationError(
                "learning.max_edges_per_tag must be at least 1".to_string(),
            ));
        }

        if l.max_write_retries == 0 {
            return Err(ConfigError::ValidationError(
                "learning.max_write_retries must be at least 1".to_string(),
            ));
        }

        if self.tiering.page_size == 0 || self.tiering.page_size > 10000 {
            return Err(ConfigError::ValidationError(
                "tiering.page_size must be between 1 and 10000".to_string(),
            ));
        }

        if self.storage_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "storage_timeout must be at least 1 second".to_string(),
            ));
        }

        self.validate_job_config("edge_learning", &self.edge_learning)?;
        self.validate_job_config("rebalance", &self.rebalance)?;

        Ok(())
    }

    fn validate_job_config(&self, name: &str, config: &JobConfig) -> Result<(), ConfigError> {
        match config.schedule {
            Schedule::Interval { every } if every < Duration::from_secs(60) => {
                return Err(ConfigError::ValidationError(format!(
                    "{}: interval must be at least 1 minute",
                    name
                )));
            }
            Schedule::Daily { hour, minute } if hour > 23 || minute > 59 => {
                return Err(ConfigError::ValidationError(format!(
                    "{}: daily schedule must be a valid HH:MM",
                    name
                )));
            }
            _ => {}
        }

        if config.max_duration < Duration::from_secs(1) {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_duration must be at least 1 second",
                name
            )));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

fn override_from_env<T: std::str::FromStr>(var: &str, slot: &mut T) -> Result<(), ConfigError> {
    match std::env::var(var) {
        Ok(raw) => {
            *slot = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("{} has an invalid value: {:?}", var, raw))
            })?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = EvolutionConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_match_deployed_values() {
        let config = EvolutionConfig::default();
        assert_eq!(config.learning.eta, 0.05);
        assert_eq!(config.learning.reward, 0.03);
        assert_eq!(config.learning.penalty, 0.01);
        assert_eq!(config.learning.w_max, 1.0);
        assert_eq!(config.learning.window_hours, 24);
        assert_eq!(config.learning.max_edges_per_tag, 32);
        assert_eq!(config.tiering.page_size, 100);
        assert_eq!(
            config.edge_learning.schedule,
            Schedule::Interval {
                every: Duration::from_secs(600)
            }
        );
        assert_eq!(config.rebalance.schedule, Schedule::Daily { hour: 2, minute: 0 });
    }

    #[test]
    fn test_validate_eta_out_of_range() {
        let mut config = EvolutionConfig::default();
        config.learning.eta = 0.0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("eta must be in"));
    }

    #[test]
    fn test_validate_max_edges_zero() {
        let mut config = EvolutionConfig::default();
        config.learning.max_edges_per_tag = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_edges_per_tag must be at least 1"));
    }

    #[test]
    fn test_validate_interval_too_short() {
        let mut config = EvolutionConfig::default();
        config.edge_learning.schedule = Schedule::Interval {
            every: Duration::from_secs(5),
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("interval must be at least 1 minute"));
    }

    #[test]
    fn test_validate_daily_out_of_range() {
        let mut config = EvolutionConfig::default();
        config.rebalance.schedule = Schedule::Daily { hour: 24, minute: 0 };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
            storage_timeout = 10

            [learning]
            eta = 0.1
            reward = 0.05
            penalty = 0.02
            w_max = 1.0
            window_hours = 48
            max_edges_per_tag = 16

            [tiering]
            page_size = 250

            [edge_learning]
            enabled = true
            max_duration = 300
            schedule = { interval = { every = 900 } }

            [rebalance]
            enabled = false
            max_duration = 1800
            schedule = { daily = { hour = 3, minute = 30 } }
        "#;

        let config = EvolutionConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.learning.eta, 0.1);
        assert_eq!(config.learning.max_edges_per_tag, 16);
        assert_eq!(config.learning.max_write_retries, 5);
        assert_eq!(config.tiering.page_size, 250);
        assert_eq!(config.storage_timeout, Duration::from_secs(10));
        assert!(!config.rebalance.enabled);
        assert_eq!(config.rebalance.schedule, Schedule::Daily { hour: 3, minute: 30 });
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EvolutionConfig::from_toml("").unwrap();
        assert_eq!(config.learning, LearningConfig::default());
        assert_eq!(config.storage_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_sections_fill_in_defaults() {
        let config = EvolutionConfig::from_toml("[learning]\neta = 0.1\n\n[tiering]\n").unwrap();

        assert_eq!(config.learning.eta, 0.1);
        assert_eq!(config.learning.reward, LearningConfig::default().reward);
        assert_eq!(config.learning.max_write_retries, 5);
        assert_eq!(config.tiering, TieringConfig::default());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = EvolutionConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EvolutionConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.learning, deserialized.learning);
        assert_eq!(config.rebalance.schedule, deserialized.rebalance.schedule);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("MME_LEARN_ETA", "0.2");
        std::env::set_var("MME_MAX_EDGES_PER_TAG", "8");

        let config = EvolutionConfig::default().with_env_overrides().unwrap();

        std::env::remove_var("MME_LEARN_ETA");
        std::env::remove_var("MME_MAX_EDGES_PER_TAG");

        assert_eq!(config.learning.eta, 0.2);
        assert_eq!(config.learning.max_edges_per_tag, 8);
        assert_eq!(config.learning.reward, 0.03);
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        std::env::set_var("MME_LEARN_R", "lots");

        let result = EvolutionConfig::default().with_env_overrides();

        std::env::remove_var("MME_LEARN_R");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("MME_LEARN_R"));
    }
}
