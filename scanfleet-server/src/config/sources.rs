use std::path::PathBuf;
use std::str::FromStr;

use scanfleet_core::CoordinatorConfig;
use serde::{Deserialize, Serialize};

use super::loader::ConfigLoadError;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<FileRedisConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

/// Overrides read from the process environment. Empty variables count as unset.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub environment: Option<String>,
    pub stale_after_secs: Option<i64>,
    pub recovery_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl EnvConfig {
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Ok(Self {
            config_path: string_var("SCANFLEET_CONFIG").map(PathBuf::from),
            redis_url: string_var("REDIS_URL"),
            environment: string_var("SCANFLEET_ENVIRONMENT"),
            stale_after_secs: parse_number_var("SCANFLEET_STALE_AFTER_SECS")?,
            recovery_interval_ms: parse_number_var("SCANFLEET_RECOVERY_INTERVAL_MS")?,
            max_retries: parse_number_var("SCANFLEET_MAX_RETRIES")?,
        })
    }

    /// Applies the coordinator overrides on top of `config`.
    pub fn apply(&self, config: &mut CoordinatorConfig) {
        if let Some(environment) = &self.environment {
            config.queue.environment = environment.clone();
        }
        if let Some(secs) = self.stale_after_secs {
            config.liveness.stale_after_secs = secs;
        }
        if let Some(ms) = self.recovery_interval_ms {
            config.recovery.interval_ms = ms;
        }
        if let Some(retries) = self.max_retries {
            config.recovery.max_retries = retries;
        }
    }
}

fn string_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigLoadError> {
    parse_number(name, string_var(name))
}

pub(crate) fn parse_number<T: FromStr>(
    name: &'static str,
    raw: Option<String>,
) -> Result<Option<T>, ConfigLoadError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::InvalidValue { name, value }),
    }
}
