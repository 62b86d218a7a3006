use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use scanfleet_core::{CoordinationError, CoordinatorConfig};
use thiserror::Error;

use super::models::{Config, ConfigMetadata, ConfigWarnings, DEFAULT_REDIS_URL, RedisConfig};
use super::sources::{EnvConfig, FileConfig};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("scanfleet.toml"),
        PathBuf::from("config/scanfleet.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    search_paths: Vec<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::with_options(ConfigLoaderOptions::default())
    }
}

/// Resolved configuration plus anything worth telling the operator about it.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self {
            options,
            search_paths: DEFAULT_CONFIG_LOCATIONS.clone(),
        }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Replaces the default locations probed when no path is given.
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        let env_file_loaded = match loaded {
            Ok(()) => true,
            Err(dotenvy::Error::Io(_)) => false,
            Err(err) => return Err(err.into()),
        };

        self.load_with_env(EnvConfig::gather()?, env_file_loaded)
    }

    /// Composes the configuration from already gathered environment overrides.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();

        if config_path.is_none() {
            warnings.push_with_hint(
                "no configuration file found; using built-in defaults",
                "Create scanfleet.toml or point SCANFLEET_CONFIG at a file",
            );
        }

        let file_config = file_config.unwrap_or_default();
        let mut coordinator = file_config.coordinator.unwrap_or_default();
        env.apply(&mut coordinator);
        coordinator.validate().map_err(ConfigLoadError::Invalid)?;

        let redis_url = match env.redis_url.clone().or(file_config.redis.map(|redis| redis.url)) {
            Some(url) => url,
            None => {
                warnings.push_with_hint(
                    format!("REDIS_URL not configured; falling back to {DEFAULT_REDIS_URL}"),
                    "Set REDIS_URL or [redis].url to reach the shared broker",
                );
                DEFAULT_REDIS_URL.to_string()
            }
        };

        Ok(ConfigLoad {
            config: Config {
                redis: RedisConfig { url: redis_url },
                coordinator,
                metadata: ConfigMetadata {
                    config_path,
                    env_file_loaded,
                },
            },
            warnings,
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let requested = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match requested {
            Some(path) if !path.exists() => return Err(ConfigLoadError::MissingConfig { path }),
            Some(path) => path,
            None => match self.search_paths.iter().find(|candidate| candidate.exists()) {
                Some(found) => found.clone(),
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid coordinator configuration")]
    Invalid(#[source] CoordinationError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

/// Effective coordinator settings rendered back as TOML.
pub fn render_coordinator(config: &CoordinatorConfig) -> Result<String, toml::ser::Error> {
    toml::to_string(&FileConfig {
        redis: None,
        coordinator: Some(config.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    fn isolated() -> ConfigLoader {
        ConfigLoader::new().with_search_paths(Vec::new())
    }

    #[test]
    fn file_values_fill_the_config() {
        let file = write_config(
            r#"
[redis]
url = "redis://broker:6379/2"

[coordinator.queue]
environment = "prod"

[coordinator.recovery]
max_retries = 5
"#,
        );

        let load = isolated()
            .with_config_path(file.path())
            .load_with_env(EnvConfig::default(), false)
            .expect("load");

        assert!(load.warnings.is_empty());
        assert_eq!(load.config.redis.url, "redis://broker:6379/2");
        assert_eq!(load.config.coordinator.queue.environment, "prod");
        assert_eq!(load.config.coordinator.recovery.max_retries, 5);
        assert_eq!(load.config.coordinator.recovery.interval_ms, 30_000);
        assert_eq!(load.config.metadata.config_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn environment_wins_over_file() {
        let file = write_config(
            r#"
[redis]
url = "redis://file:6379"

[coordinator.liveness]
stale_after_secs = 90
"#,
        );
        let env = EnvConfig {
            redis_url: Some("redis://env:6379".into()),
            stale_after_secs: Some(20),
            ..EnvConfig::default()
        };

        let load = isolated()
            .with_config_path(file.path())
            .load_with_env(env, false)
            .expect("load");

        assert_eq!(load.config.redis.url, "redis://env:6379");
        assert_eq!(load.config.coordinator.liveness.stale_after_secs, 20);
    }

    #[test]
    fn env_path_is_used_when_no_explicit_path() {
        let file = write_config("[coordinator.queue]\nenvironment = \"from-env-path\"\n");
        let env = EnvConfig {
            config_path: Some(file.path().to_path_buf()),
            ..EnvConfig::default()
        };

        let load = isolated().load_with_env(env, false).expect("load");
        assert_eq!(load.config.coordinator.queue.environment, "from-env-path");
    }

    #[test]
    fn missing_file_falls_back_to_defaults_with_warnings() {
        let load = isolated()
            .load_with_env(EnvConfig::default(), false)
            .expect("load");

        assert_eq!(load.config.redis.url, DEFAULT_REDIS_URL);
        assert_eq!(load.config.coordinator.queue.environment, "default");
        assert_eq!(load.warnings.items.len(), 2);
        assert!(load.config.metadata.config_path.is_none());
    }

    #[test]
    fn default_location_is_probed() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("scanfleet.toml");
        fs::write(&path, "[redis]\nurl = \"redis://probed:6379\"\n").expect("write");

        let load = ConfigLoader::new()
            .with_search_paths(vec![dir.path().join("missing.toml"), path.clone()])
            .load_with_env(EnvConfig::default(), false)
            .expect("load");

        assert_eq!(load.config.redis.url, "redis://probed:6379");
        assert_eq!(load.config.metadata.config_path, Some(path));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = TempDir::new().expect("temp dir");
        let err = isolated()
            .with_config_path(dir.path().join("absent.toml"))
            .load_with_env(EnvConfig::default(), false)
            .expect_err("missing");
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let file = write_config("[coordinator.queue\nenvironment = ");
        let err = isolated()
            .with_config_path(file.path())
            .load_with_env(EnvConfig::default(), false)
            .expect_err("malformed");
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }

    #[test]
    fn invalid_values_are_rejected_after_composition() {
        let file = write_config("[coordinator.liveness]\nstale_after_secs = 30\n");
        let env = EnvConfig {
            stale_after_secs: Some(0),
            ..EnvConfig::default()
        };
        let err = isolated()
            .with_config_path(file.path())
            .load_with_env(env, false)
            .expect_err("zero window");
        assert!(matches!(err, ConfigLoadError::Invalid(_)));
    }

    #[test]
    fn rendered_config_reads_back() {
        let mut config = CoordinatorConfig::default();
        config.queue.environment = "rendered".into();
        let rendered = render_coordinator(&config).expect("render");

        let parsed: FileConfig = toml::from_str(&rendered).expect("parse rendered");
        let coordinator = parsed.coordinator.expect("coordinator section");
        assert_eq!(coordinator.queue.environment, "rendered");
    }
}
