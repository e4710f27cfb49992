use crate::clienv;
use crate::daemon::recovery::{BackoffPolicy, RecoveryPolicy};
use crate::daemon::supervisor::SupervisorOptions;
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 300;

/// Recovery delay growth, as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryBackoff {
    #[default]
    Fixed,
    Exponential,
}

/// Runtime parameters supplied to the daemon at construction.
///
/// Loaded from `$GPU_AGENT_CONFIG_DIR/config.toml`; every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Seconds between sampling passes (1..=300)
    pub monitoring_interval_secs: u64,
    /// tracing filter directive, e.g. "info" or "gpu_agent=debug"
    pub log_level: String,
    /// Snapshots buffered between collector and consumer
    pub queue_capacity: usize,
    pub supervisor_poll_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub max_recovery_attempts: u32,
    pub recovery_delay_secs: u64,
    pub recovery_backoff: RecoveryBackoff,
    /// Let the health monitor trigger recovery of unhealthy services
    pub auto_recover: bool,
    /// How often the reference consumer drains the queue
    pub consumer_poll_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: 5,
            log_level: "info".to_string(),
            queue_capacity: 16,
            supervisor_poll_secs: 5,
            shutdown_timeout_secs: 5,
            max_recovery_attempts: 3,
            recovery_delay_secs: 5,
            recovery_backoff: RecoveryBackoff::Fixed,
            auto_recover: false,
            consumer_poll_ms: 500,
        }
    }
}

impl AgentConfig {
    pub fn config_path() -> PathBuf {
        clienv::config_path()
    }

    /// Load from the default location, falling back to defaults when the file is absent.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        if let Some(level) = clienv::log_level_override() {
            config.log_level = level;
        }
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading agent config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AgentError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.monitoring_interval_secs) {
            return Err(AgentError::Config(format!(
                "monitoring_interval_secs must be within {}..={}, got {}",
                MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, self.monitoring_interval_secs
            )));
        }
        if self.queue_capacity == 0 {
            return Err(AgentError::Config("queue_capacity must be positive".into()));
        }
        if self.supervisor_poll_secs == 0 {
            return Err(AgentError::Config(
                "supervisor_poll_secs must be positive".into(),
            ));
        }
        if self.consumer_poll_ms == 0 {
            return Err(AgentError::Config("consumer_poll_ms must be positive".into()));
        }
        if self.log_level.trim().is_empty() {
            return Err(AgentError::Config("log_level must not be empty".into()));
        }
        Ok(())
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        let delay = Duration::from_secs(self.recovery_delay_secs);
        let backoff = match self.recovery_backoff {
            RecoveryBackoff::Fixed => BackoffPolicy::Fixed,
            RecoveryBackoff::Exponential => BackoffPolicy::Exponential {
                factor: 2,
                max: delay * 8,
            },
        };
        RecoveryPolicy {
            max_attempts: self.max_recovery_attempts,
            delay,
            backoff,
            ..RecoveryPolicy::default()
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_secs(self.supervisor_poll_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            install_signal_handlers: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitoring_interval(), Duration::from_secs(5));
        assert_eq!(config.recovery_policy().max_attempts, 3);
        assert_eq!(config.recovery_policy().backoff, BackoffPolicy::Fixed);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AgentConfig::parse("monitoring_interval_secs = 2\n").unwrap();
        assert_eq!(config.monitoring_interval_secs, 2);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_interval_out_of_range_rejected() {
        assert!(AgentConfig::parse("monitoring_interval_secs = 0").is_err());
        assert!(AgentConfig::parse("monitoring_interval_secs = 301").is_err());
        assert!(AgentConfig::parse("monitoring_interval_secs = 300").is_ok());
    }

    #[test]
    fn test_exponential_backoff_from_file() {
        let config = AgentConfig::parse(
            "recovery_backoff = \"exponential\"\nrecovery_delay_secs = 2\n",
        )
        .unwrap();
        match config.recovery_policy().backoff {
            BackoffPolicy::Exponential { factor, max } => {
                assert_eq!(factor, 2);
                assert_eq!(max, Duration::from_secs(16));
            }
            other => panic!("unexpected backoff: {:?}", other),
        }
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_load_from_file_and_round_trip_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "log_level = \"debug\"\nauto_recover = true\n").unwrap();

        let config = AgentConfig::load_from(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.auto_recover);

        let rendered = config.to_toml().unwrap();
        assert_eq!(AgentConfig::parse(&rendered).unwrap(), config);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let err = AgentConfig::parse("monitoring_interval_secs = \"fast\"").unwrap_err();
        assert!(matches!(err, AgentError::Toml(_)));
    }
}
