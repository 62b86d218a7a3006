use std::path::PathBuf;

use scanfleet_core::CoordinatorConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub coordinator: CoordinatorConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
