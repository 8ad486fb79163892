use std::num::NonZeroUsize;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

const ENV_MASTER: &str = "FLOWBRIDGE_MASTER";
const ENV_APP_NAME: &str = "FLOWBRIDGE_APP_NAME";
const ENV_PARALLELISM: &str = "FLOWBRIDGE_PARALLELISM";

/// Where the compute engine runs its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Master {
    /// In-process worker pool with the given number of threads.
    Local(NonZeroUsize),
}

impl Master {
    pub fn threads(&self) -> usize {
        match self {
            Master::Local(n) => n.get(),
        }
    }
}

impl FromStr for Master {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s == "local" {
            return Ok(Master::Local(NonZeroUsize::MIN));
        }

        let threads = s
            .strip_prefix("local[")
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| ConfigError::UnsupportedMaster(s.to_string()))?;

        if threads == "*" {
            let n = std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);
            return Ok(Master::Local(n));
        }

        let n: usize = threads
            .parse()
            .map_err(|_| ConfigError::UnsupportedMaster(s.to_string()))?;

        NonZeroUsize::new(n)
            .map(Master::Local)
            .ok_or_else(|| ConfigError::ZeroParallelism(s.to_string()))
    }
}

/// Settings for one engine session.
///
/// Missing fields fall back to their defaults when deserialized, so a partial
/// JSON document such as `{"master": "local[4]"}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the application, used in log output.
    pub app_name: String,
    /// Engine master, one of `local`, `local[N]` or `local[*]`.
    pub master: String,
    /// Number of partitions for distributed local sequences. Defaults to the
    /// number of worker threads.
    pub parallelism: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_name: "flowbridge".to_string(),
            master: "local[1]".to_string(),
            parallelism: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_master(mut self, master: impl Into<String>) -> Self {
        self.master = master.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Parses a JSON document into a config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Default config with `FLOWBRIDGE_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    fn merge_env(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(master) = var(ENV_MASTER) {
            self.master = master;
        }

        if let Some(name) = var(ENV_APP_NAME) {
            self.app_name = name;
        }

        if let Some(value) = var(ENV_PARALLELISM) {
            let parsed = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_PARALLELISM,
                value: value.clone(),
            })?;
            self.parallelism = Some(parsed);
        }

        Ok(self)
    }

    pub fn master(&self) -> Result<Master, ConfigError> {
        self.master.parse()
    }

    /// Partition count for distributed sequences, never zero.
    pub fn partitions(&self) -> Result<usize, ConfigError> {
        match self.parallelism {
            Some(0) => Err(ConfigError::ZeroParallelism(self.master.clone())),
            Some(n) => Ok(n),
            None => Ok(self.master()?.threads()),
        }
    }
}
