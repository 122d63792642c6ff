//! Pool configuration.
//!
//! Loaded from YAML files or environment variables, mirroring the layered
//! configuration of the host application.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::Result;

/// Default configuration file name (extension resolved by the loader).
pub const DEFAULT_CONFIG_FILE: &str = "brokerpool";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "BROKERPOOL_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "BROKERPOOL";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "BROKERPOOL_LOG";
/// Environment variable naming the running service.
pub const APP_NAME_ENV_VAR: &str = "BROKERPOOL_APP_NAME";

/// Default request/reply timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Broker URL.
    pub server: String,
    /// Number of connections kept in the pool.
    pub connection_total: usize,
    /// Replace connections that close (starts the health supervisor).
    pub reconnect_when_closed: bool,
    /// Client name reported to the broker. Falls back to the service identity.
    pub connection_name: Option<String>,
    /// Username for user/password authentication.
    pub user: Option<String>,
    /// Password for user/password authentication.
    pub password: Option<String>,
    /// Token authentication (ignored when user/password are set).
    pub token: Option<String>,
    /// Client-side reconnect attempts before a connection is considered
    /// closed. `None` retries forever, so the connection never closes.
    pub max_reconnects: Option<usize>,
    /// Default timeout for request/reply calls, in seconds.
    pub request_timeout_secs: u64,
    /// Health supervisor schedule.
    pub health_check: HealthCheckConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            server: "nats://localhost:4222".to_string(),
            connection_total: 1,
            reconnect_when_closed: true,
            connection_name: None,
            user: None,
            password: None,
            token: None,
            max_reconnects: Some(60),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// Health supervisor schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Delay before the first check, in milliseconds.
    pub initial_delay_ms: u64,
    /// Interval between checks, in milliseconds.
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            interval_ms: 8_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl PoolConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `brokerpool.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Default timeout for request/reply calls.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Identity of this service on the broker.
    ///
    /// The configured connection name, else `APP_NAME_ENV_VAR`, else a
    /// random UUID so concurrent instances stay distinguishable.
    pub fn event_source(&self) -> String {
        self.connection_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                std::env::var(APP_NAME_ENV_VAR)
                    .ok()
                    .filter(|name| !name.is_empty())
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}
