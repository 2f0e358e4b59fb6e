//! Configuration Loader
//!
//! Environment-aware layering of defaults, TOML files and environment
//! variables with the `config` crate.

use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;

/// Base name of the configuration files
const CONFIG_FILE_STEM: &str = "orchestrator";
/// Prefix of configuration environment variables
const ENV_PREFIX: &str = "ORCHESTRATOR";
/// Separator between sections in environment variable names
const ENV_SEPARATOR: &str = "__";

/// Loaded configuration together with where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Tests use this to avoid touching process-wide variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));
        debug!(
            environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment,
            max_connections = config.database.max_connections,
            orchestrator_queue = %config.queues.orchestrator_queue,
            sweeper_enabled = config.sweeper.enabled,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    fn build(config_directory: &Path, environment: &str) -> ConfigResult<OrchestratorConfig> {
        let base_file = config_directory.join(format!("{CONFIG_FILE_STEM}.toml"));
        let env_file = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}.toml"));

        Config::builder()
            .add_source(File::from(base_file).required(false))
            .add_source(File::from(env_file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize::<OrchestratorConfig>())
            .map_err(|e| ConfigurationError::load(environment, e))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `ORCHESTRATOR_ENV`, then `APP_ENV`, defaulting to development
    pub fn detect_environment() -> String {
        env::var("ORCHESTRATOR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}
