pub mod connection_string;

use crate::error::{DdbcError, ErrorInfo, Result};
use connection_string::parse_bool_flag;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_POOL_MAX_SIZE: &str = "DDBC_POOL_MAX_SIZE";
pub const ENV_POOL_IDLE_TIMEOUT_SECS: &str = "DDBC_POOL_IDLE_TIMEOUT_SECS";
pub const ENV_POOLING: &str = "DDBC_POOLING";
pub const ENV_FETCH_SIZE: &str = "DDBC_FETCH_SIZE";
pub const ENV_LOG_LEVEL: &str = "DDBC_LOG_LEVEL";

pub const DEFAULT_POOL_MAX_SIZE: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

fn config_error(message: String) -> DdbcError {
    DdbcError::Config(ErrorInfo::message(message))
}

/// Limits applied to each connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
    #[serde(rename = "idle_timeout_secs", with = "duration_secs")]
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// A zero timeout makes every idle connection stale on the next acquire.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(config_error("pool max_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pooling: bool,
    pub pool: PoolSettings,
    /// Default `fetchmany` batch size and initial cursor `arraysize`.
    pub default_fetch_size: usize,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling: false,
            pool: PoolSettings::default(),
            default_fetch_size: 1,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| config_error(format!("invalid engine configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `DDBC_*` environment variables. Unset variables
    /// keep their default; malformed ones are rejected.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = read_env(ENV_POOL_MAX_SIZE) {
            config.pool.max_size = parse_number(ENV_POOL_MAX_SIZE, &v)? as usize;
        }
        if let Some(v) = read_env(ENV_POOL_IDLE_TIMEOUT_SECS) {
            config.pool.idle_timeout = Duration::from_secs(parse_number(ENV_POOL_IDLE_TIMEOUT_SECS, &v)?);
        }
        if let Some(v) = read_env(ENV_FETCH_SIZE) {
            config.default_fetch_size = parse_number(ENV_FETCH_SIZE, &v)? as usize;
        }
        if let Some(v) = read_env(ENV_POOLING) {
            config.pooling = parse_bool_flag(&v)
                .ok_or_else(|| config_error(format!("{ENV_POOLING} must be a boolean, got '{v}'")))?;
        }
        if let Some(v) = read_env(ENV_LOG_LEVEL) {
            config.log_level = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.default_fetch_size == 0 {
            return Err(config_error("default_fetch_size must be at least 1".to_string()));
        }
        self.level_filter().map(|_| ())
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse::<LevelFilter>()
            .map_err(|_| config_error(format!("unknown log level '{}'", self.log_level)))
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| config_error(format!("{name} must be a non-negative integer, got '{value}'")))
}
