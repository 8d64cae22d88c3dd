// ⚙️ Settings - environment-driven configuration
// Reads `.env` (if present) then the process environment.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

use crate::auth::DEFAULT_IDENTITY_ENDPOINT;
use crate::scraper::DEFAULT_CARBON_PRICES_URL;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ============================================================================
// LOGGING
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    /// Initialize the global tracing subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let result = match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).try_init(),
            _ => fmt().with_env_filter(filter).try_init(),
        };

        // A subscriber may already be installed (tests, embedding).
        if result.is_err() {
            tracing::debug!("tracing subscriber already initialized");
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub port: u16,
    pub database_path: PathBuf,
    /// API key for the identity provider. Optional so that commands that
    /// never verify tokens can run without it.
    pub identity_api_key: Option<String>,
    pub identity_endpoint: String,
    pub carbon_prices_url: String,
    pub tick_interval: Duration,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 3000,
            database_path: PathBuf::from("greenledger.db"),
            identity_api_key: None,
            identity_endpoint: DEFAULT_IDENTITY_ENDPOINT.into(),
            carbon_prices_url: DEFAULT_CARBON_PRICES_URL.into(),
            tick_interval: Duration::from_millis(5000),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Missing .env is fine; the environment may already be populated.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            settings.bind_addr = addr;
        }

        if let Some(port) = lookup("PORT") {
            settings.port = port.trim().parse().map_err(|e| ConfigError::InvalidValue {
                field: "PORT",
                reason: format!("{e}"),
            })?;
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            settings.database_path = PathBuf::from(path);
        }

        settings.identity_api_key = lookup("IDENTITY_API_KEY").filter(|k| !k.trim().is_empty());

        if let Some(endpoint) = lookup("IDENTITY_ENDPOINT") {
            settings.identity_endpoint = endpoint;
        }

        if let Some(url) = lookup("CARBON_PRICES_URL") {
            settings.carbon_prices_url = url;
        }

        if let Some(ms) = lookup("TICK_INTERVAL_MS") {
            let ms: u64 = ms.trim().parse().map_err(|e| ConfigError::InvalidValue {
                field: "TICK_INTERVAL_MS",
                reason: format!("{e}"),
            })?;
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "TICK_INTERVAL_MS",
                    reason: "must be greater than zero".into(),
                });
            }
            settings.tick_interval = Duration::from_millis(ms);
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            settings.logging.level = level;
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            settings.logging.format = format;
        }

        Ok(settings)
    }

    /// The identity API key, or an error naming the missing variable.
    pub fn require_identity_api_key(&self) -> Result<&str, ConfigError> {
        self.identity_api_key
            .as_deref()
            .ok_or(ConfigError::MissingField {
                field: "IDENTITY_API_KEY",
            })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
