//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (Telegram bot token) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use crate::retry::{DEFAULT_BASE_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_MS};
use crate::types::SweepError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Asset symbols to watch, e.g. `["USDT", "BTC"]`.
    pub assets: Vec<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Pause before each asset's transfer batch so balances can settle.
    #[serde(default = "default_transfer_delay_secs")]
    pub transfer_delay_secs: u64,
    /// Put a released deposit back on the watchlist when its balance
    /// query fails, instead of dropping it.
    #[serde(default)]
    pub requeue_on_balance_failure: bool,
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn transfer_delay(&self) -> Duration {
        Duration::from_secs(self.transfer_delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_name")]
    pub name: String,
    /// JSON fixture seeding the paper exchange.
    #[serde(default)]
    pub fixture_path: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: default_exchange_name(),
            fixture_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    pub telegram_chat_id_env: Option<String>,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_transfer_delay_secs() -> u64 {
    3
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_backoff_ms() -> u64 {
    DEFAULT_BASE_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_exchange_name() -> String {
    "paper".to_string()
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        let assets = &self.watcher.assets;
        if assets.is_empty() {
            return Err(SweepError::Config("watcher.assets must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for asset in assets {
            if asset.trim().is_empty() {
                return Err(SweepError::Config("watcher.assets contains a blank symbol".into()));
            }
            if !seen.insert(asset.as_str()) {
                return Err(SweepError::Config(format!("duplicate asset in watcher.assets: {asset}")));
            }
        }

        if self.watcher.interval_secs == 0 {
            return Err(SweepError::Config("watcher.interval_secs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SweepError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(SweepError::Config(
                "retry.base_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }

        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
