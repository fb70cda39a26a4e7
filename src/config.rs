//! Ledger configuration.
//!
//! Defaults, then an optional JSON file, then `FLEET_LEDGER_*` environment
//! variables, in increasing priority.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Pool size. Writers are serialized by SQLite, readers are not.
    pub max_connections: u32,
    /// How long a connection waits on SQLite's write lock.
    pub busy_timeout_ms: u64,
    /// How long a write waits for its vehicle's lock before giving up with `Busy`.
    pub lock_timeout_ms: u64,
    /// Lifetime of QR tokens issued without an explicit ttl.
    pub default_token_ttl_secs: i64,
    /// Reject spends naming a service center that isn't registered.
    pub validate_service_centers: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: "fleet-ledger.db".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5_000,
            lock_timeout_ms: 2_000,
            default_token_ttl_secs: 15 * 60,
            validate_service_centers: false,
        }
    }
}

impl LedgerConfig {
    /// Load from `FLEET_LEDGER_CONFIG` (if it points at a file) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FLEET_LEDGER_CONFIG") {
            Ok(path) if Path::new(&path).exists() => Self::from_json_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_json_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        let config: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_database_path(mut self, path: impl Into<String>) -> Self {
        self.database_path = path.into();
        self
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("FLEET_LEDGER_DB") {
            self.database_path = path;
        }
        if let Some(v) = env_parse("FLEET_LEDGER_MAX_CONNECTIONS")? {
            self.max_connections = v;
        }
        if let Some(v) = env_parse("FLEET_LEDGER_BUSY_TIMEOUT_MS")? {
            self.busy_timeout_ms = v;
        }
        if let Some(v) = env_parse("FLEET_LEDGER_LOCK_TIMEOUT_MS")? {
            self.lock_timeout_ms = v;
        }
        if let Some(v) = env_parse("FLEET_LEDGER_TOKEN_TTL_SECS")? {
            self.default_token_ttl_secs = v;
        }
        if let Some(v) = env_parse("FLEET_LEDGER_VALIDATE_SERVICE_CENTERS")? {
            self.validate_service_centers = v;
        }
        self.validate()
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// `None` when the configured lifetime is not positive or too large for chrono.
    pub fn default_token_ttl(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_seconds(self.default_token_ttl_secs)
            .filter(|ttl| *ttl > chrono::Duration::zero())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_token_ttl().is_none() {
            return Err(ConfigError::InvalidValue(
                "default_token_ttl_secs".to_string(),
                self.default_token_ttl_secs.to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {0}: '{1}'")]
    InvalidValue(String, String),
}
