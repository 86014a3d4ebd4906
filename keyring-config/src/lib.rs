//! Configuration management for the signing key ring

use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;

/// Prefix of every environment variable read by [`KeyRingConfig::from_env`]
pub const ENV_PREFIX: &str = "KEYRING";

/// Optional configuration file, read before the environment
pub const CONFIG_FILE_ENV: &str = "KEYRING_CONFIG_FILE";

/// Longest rotation, retention or refresh period accepted, in days
pub const MAX_PERIOD_DAYS: u64 = 3650;

/// Longest delay, skew or interval accepted, in seconds
pub const MAX_DELAY_SECS: u64 = 366 * 24 * 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Key ring configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyRingConfig {
    /// Signing algorithm for new keys (`RS256` or `EdDSA`)
    pub algorithm: String,
    pub rsa_key_size: usize,
    pub rotation_period_days: u32,
    pub propagation_window_hours: u32,
    pub retention_window_days: u32,
    pub new_key_activation_delay_secs: u64,
    pub refresh_period_hours: u32,
    pub max_clock_skew_secs: u64,
    pub activation_stabilization_secs: u64,
    pub failure_retry_secs: u64,
    /// Interval of the background rotation check, 0 disables it
    pub rotation_check_interval_secs: u64,
    /// Directory of the local key repository
    pub storage_path: String,
    pub log_level: Option<String>,
}

impl Default for KeyRingConfig {
    fn default() -> Self {
        Self {
            algorithm: "RS256".to_string(),
            rsa_key_size: 2048,
            rotation_period_days: 90,
            propagation_window_hours: 48,
            retention_window_days: 30,
            new_key_activation_delay_secs: 0,
            refresh_period_hours: 24,
            max_clock_skew_secs: 300,
            activation_stabilization_secs: 0,
            failure_retry_secs: 120,
            rotation_check_interval_secs: 3600,
            storage_path: "./keys".to_string(),
            log_level: None,
        }
    }
}

impl KeyRingConfig {
    /// Load configuration from `.env`, the optional file named by
    /// `KEYRING_CONFIG_FILE`, and `KEYRING_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let file = env::var(CONFIG_FILE_ENV).ok();
        Self::load(file.as_deref().map(Path::new), ENV_PREFIX)
    }

    /// Load from an optional file, then environment variables with `env_prefix`
    pub fn load(file: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder =
            builder.add_source(config::Environment::with_prefix(env_prefix).try_parsing(true));

        let config: KeyRingConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check relations between values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation_period_days == 0 {
            return Err(ConfigError::Invalid(
                "rotation_period_days must be positive".to_string(),
            ));
        }
        if self.refresh_period_hours == 0 {
            return Err(ConfigError::Invalid(
                "refresh_period_hours must be positive".to_string(),
            ));
        }
        if u64::from(self.propagation_window_hours) >= u64::from(self.rotation_period_days) * 24 {
            return Err(ConfigError::Invalid(format!(
                "propagation_window_hours ({}) must be shorter than the rotation period ({} days)",
                self.propagation_window_hours, self.rotation_period_days
            )));
        }
        for (name, value, max) in [
            ("rotation_period_days", self.rotation_period_days, MAX_PERIOD_DAYS),
            ("retention_window_days", self.retention_window_days, MAX_PERIOD_DAYS),
            ("refresh_period_hours", self.refresh_period_hours, MAX_PERIOD_DAYS * 24),
        ] {
            Self::check_upper_bound(name, value.into(), max)?;
        }
        for (name, value) in [
            ("new_key_activation_delay_secs", self.new_key_activation_delay_secs),
            ("max_clock_skew_secs", self.max_clock_skew_secs),
            ("activation_stabilization_secs", self.activation_stabilization_secs),
            ("failure_retry_secs", self.failure_retry_secs),
            ("rotation_check_interval_secs", self.rotation_check_interval_secs),
        ] {
            Self::check_upper_bound(name, value, MAX_DELAY_SECS)?;
        }
        if self.storage_path.trim().is_empty() {
            return Err(ConfigError::Invalid("storage_path must not be empty".to_string()));
        }
        Ok(())
    }

    fn check_upper_bound(name: &str, value: u64, max: u64) -> Result<(), ConfigError> {
        if value > max {
            return Err(ConfigError::Invalid(format!(
                "{} ({}) must not exceed {}",
                name, value, max
            )));
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}
