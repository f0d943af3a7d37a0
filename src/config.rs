use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::MAX_BATCH_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    Local,
    Postgres,
}

impl FromStr for BusBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            "postgres" | "pg" => Ok(Self::Postgres),
            other => Err(anyhow::anyhow!("unknown BUS_BACKEND: {}", other)),
        }
    }
}

/// Server process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs every backend in memory.
    pub database_url: Option<String>,
    pub api_bind_address: String,
    pub bus_backend: BusBackend,
    pub presence_window: Duration,
    pub presence_ttl: Duration,
    pub connection_buffer: usize,
    pub cleanup_interval: Duration,
    pub auth_timeout: Duration,
    pub idle_timeout: Duration,
    /// HS256 secret of the account service's user credentials. Without it
    /// only an already registered device can enroll another.
    pub user_token_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            api_bind_address: "0.0.0.0:8080".to_string(),
            bus_backend: BusBackend::Local,
            presence_window: Duration::from_secs(60),
            presence_ttl: Duration::from_secs(300),
            connection_buffer: 256,
            cleanup_interval: Duration::from_secs(3600),
            auth_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            user_token_secret: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let bus_backend = match env::var("BUS_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.bus_backend,
        };
        if bus_backend == BusBackend::Postgres && database_url.is_none() {
            anyhow::bail!("BUS_BACKEND=postgres requires DATABASE_URL");
        }

        Ok(Self {
            database_url,
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| defaults.api_bind_address.clone()),
            bus_backend,
            presence_window: secs_var("PRESENCE_WINDOW_SECS", defaults.presence_window)?,
            presence_ttl: secs_var("PRESENCE_TTL_SECS", defaults.presence_ttl)?,
            connection_buffer: match env::var("CONNECTION_BUFFER") {
                Ok(v) => v.parse().context("CONNECTION_BUFFER must be a number")?,
                Err(_) => defaults.connection_buffer,
            },
            cleanup_interval: secs_var("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval)?,
            auth_timeout: secs_var("AUTH_TIMEOUT_SECS", defaults.auth_timeout)?,
            idle_timeout: secs_var("IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            user_token_secret: env::var("USER_TOKEN_SECRET")
                .ok()
                .filter(|secret| !secret.is_empty()),
        })
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(v) => {
            let secs: u64 = v
                .parse()
                .with_context(|| format!("{} must be a whole number of seconds", name))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    Timestamp,
    ClientWins,
    ServerWins,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
        }
    }
}

/// Client sync engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub sync_interval_seconds: u64,
    pub batch_size: usize,
    pub max_retry_attempts: u32,
    pub enable_batch_optimization: bool,
    pub enable_conflict_resolution: bool,
    pub conflict_resolution_strategy: ConflictStrategy,
    pub exponential_backoff_base: f64,
    pub max_backoff_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_seconds: 30,
            batch_size: 50,
            max_retry_attempts: 5,
            enable_batch_optimization: true,
            enable_conflict_resolution: true,
            conflict_resolution_strategy: ConflictStrategy::Timestamp,
            exponential_backoff_base: 2.0,
            max_backoff_delay_ms: 300_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval_seconds == 0 {
            return Err(ConfigError::Invalid("sync_interval_seconds must be > 0".into()));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if !(self.exponential_backoff_base >= 1.0 && self.exponential_backoff_base.is_finite()) {
            return Err(ConfigError::Invalid(
                "exponential_backoff_base must be a finite number >= 1".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The strategy actually in force. Disabled resolution means the server
    /// copy always wins.
    pub fn effective_strategy(&self) -> ConflictStrategy {
        if self.enable_conflict_resolution {
            self.conflict_resolution_strategy
        } else {
            ConflictStrategy::ServerWins
        }
    }

    /// Delay before an item that has failed `attempts` times may be retried.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let cap = Duration::from_millis(self.max_backoff_delay_ms);
        let secs = self.exponential_backoff_base.powi(attempts.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs * 1000.0 >= self.max_backoff_delay_ms as f64 {
            return cap;
        }
        Duration::from_secs_f64(secs).min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_defaults_from_partial_json() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"batch_size": 10, "conflict_resolution_strategy": "client_wins"}"#)
                .unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.sync_interval_seconds, 30);
        assert_eq!(config.conflict_resolution_strategy, ConflictStrategy::ClientWins);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let config = SyncConfig::default();
        let mut previous = Duration::ZERO;
        for attempts in 0..40 {
            let delay = config.backoff_delay(attempts);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(config.max_backoff_delay_ms));
            previous = delay;
        }
        assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(30), Duration::from_millis(300_000));
    }

    #[test]
    fn test_disabled_resolution_means_server_wins() {
        let config = SyncConfig {
            enable_conflict_resolution: false,
            ..Default::default()
        };
        assert_eq!(config.effective_strategy(), ConflictStrategy::ServerWins);
    }

    #[test]
    fn test_batch_size_must_fit_server_batch_limit() {
        let at_limit = SyncConfig {
            batch_size: MAX_BATCH_SIZE,
            ..Default::default()
        };
        assert!(at_limit.validate().is_ok());

        let over = SyncConfig {
            batch_size: MAX_BATCH_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(over.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_sync_config() {
        let config = SyncConfig {
            exponential_backoff_base: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
