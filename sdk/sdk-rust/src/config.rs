use chain::FinalityConfig;
use engine::BackoffConfig;
use fhe_counter::{DeploymentRegistry, RegistryError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_AUTH_DAYS: &str = "FHE_COUNTER_AUTH_DAYS";
pub const ENV_RECEIPT_POLL_MS: &str = "FHE_COUNTER_RECEIPT_POLL_MS";
pub const ENV_RECEIPT_TIMEOUT_SECS: &str = "FHE_COUNTER_RECEIPT_TIMEOUT_SECS";
pub const ENV_REGISTRY: &str = "FHE_COUNTER_REGISTRY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{var}={value:?} is not a valid value")]
    InvalidEnv { var: &'static str, value: String },
    #[error("deployment registry: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub authorization_duration_days: u32,
    pub receipt_poll_interval_ms: u64,
    /// `None` waits for finality indefinitely.
    pub receipt_timeout_secs: Option<u64>,
    pub engine_ready: BackoffConfig,
    pub registry_path: Option<PathBuf>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            authorization_duration_days: 365,
            receipt_poll_interval_ms: 250,
            receipt_timeout_secs: Some(120),
            engine_ready: BackoffConfig::default(),
            registry_path: None,
        }
    }
}

impl SdkConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| env::var(var).ok())
    }

    /// Applies overrides from `lookup`, keyed by the `FHE_COUNTER_*` variable names.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(days) = parse_var(&lookup, ENV_AUTH_DAYS)? {
            self.authorization_duration_days = days;
        }
        if let Some(ms) = parse_var(&lookup, ENV_RECEIPT_POLL_MS)? {
            self.receipt_poll_interval_ms = ms;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_RECEIPT_TIMEOUT_SECS)? {
            // 0 disables the timeout
            self.receipt_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(path) = lookup(ENV_REGISTRY).filter(|p| !p.is_empty()) {
            self.registry_path = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    pub fn finality(&self) -> FinalityConfig {
        FinalityConfig {
            poll_interval: Duration::from_millis(self.receipt_poll_interval_ms.max(1)),
            timeout: self.receipt_timeout_secs.map(Duration::from_secs),
        }
    }

    /// The registry file named by `registry_path`, or the built-in address book.
    pub fn registry(&self) -> Result<DeploymentRegistry, ConfigError> {
        match &self.registry_path {
            Some(path) => Ok(DeploymentRegistry::load(path)?),
            None => Ok(DeploymentRegistry::builtin()),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}
