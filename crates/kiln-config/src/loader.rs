//! Configuration loader with layered sources.

use crate::app_config::default_environment;
use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use kiln_core::{KilnError, KilnResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Environment variable selecting the `config/{environment}.toml` layer.
pub const ENVIRONMENT_VAR: &str = "KILN_ENVIRONMENT";

/// Prefix of environment variable overrides, e.g. `KILN__DATABASE__URL`.
pub const ENV_PREFIX: &str = "KILN";

/// Configuration loader with runtime reload support.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
    environment: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `KILN__` prefix
    ///
    /// The environment comes from `KILN_ENVIRONMENT` (default `development`).
    pub fn new(config_dir: impl Into<PathBuf>) -> KilnResult<Self> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| default_environment());
        Self::with_environment(config_dir, environment)
    }

    /// Creates a loader for an explicit environment.
    pub fn with_environment(
        config_dir: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> KilnResult<Self> {
        let config_dir = config_dir.into();
        let environment = environment.into();
        let config = Self::load_config(&config_dir, &environment)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
            environment,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> KilnResult<Self> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Returns the environment this loader was built for.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Reloads the configuration from disk.
    ///
    /// The current configuration is kept if the new one fails to load or
    /// validate.
    pub async fn reload(&self) -> KilnResult<()> {
        let new_config = Self::load_config(&self.config_dir, &self.environment)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &Path, environment: &str) -> KilnResult<AppConfig> {
        info!(environment, config_dir = %config_dir.display(), "Loading configuration");

        let mut builder = Config::builder();

        for layer in ["default", environment, "local"] {
            let path = config_dir.join(format!("{}.toml", layer));
            if path.exists() {
                debug!("Loading {} config from: {}", layer, path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        // Environment variables win over every file (KILN__ prefix)
        builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override("app.environment", environment)
            .map_err(config_error_to_kiln_error)?;

        let app_config: AppConfig = builder
            .build()
            .map_err(config_error_to_kiln_error)?
            .try_deserialize()
            .map_err(config_error_to_kiln_error)?;

        Self::validate_config(&app_config)?;

        Ok(app_config)
    }

    /// Validates the configuration.
    fn validate_config(config: &AppConfig) -> KilnResult<()> {
        if config.database.url.is_empty() {
            return Err(KilnError::Configuration("Database URL is required".to_string()));
        }

        if config.database.max_connections == 0 {
            return Err(KilnError::Configuration(
                "database.max_connections must be greater than zero".to_string(),
            ));
        }

        if config.app.is_production() && config.database.is_sqlite() {
            warn!("Using SQLite in production; a single writer limits claim throughput");
        }

        config
            .jobs
            .validate()
            .map_err(|e| KilnError::Configuration(e.to_string()))
    }

    /// Gets a specific configuration value by key path, e.g. `jobs.retry.max_attempts`.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error_to_kiln_error(err: ConfigError) -> KilnError {
    KilnError::Configuration(err.to_string())
}
