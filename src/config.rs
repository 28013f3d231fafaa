//! Runtime configuration for the sync core
//!
//! Defaults come from [`crate::constants`]. `SyncConfig::from_env()` layers
//! `MARKET_SYNC_*` environment variables on top, and `validate()` rejects
//! values the connection manager cannot work with.

use crate::constants::{
    BINANCE_API_URL, BINANCE_WS_URL, COINGECKO_API_URL, DEFAULT_PAGE_SIZE, DEFAULT_QUOTE_ASSET,
    DEFAULT_UNIVERSE_SIZE, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS, MAX_RECONNECT_ATTEMPTS,
    POLL_INTERVAL_SECS, REQUEST_TIMEOUT_SECS,
};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry (in milliseconds)
    pub initial_ms: u64,
    /// Upper bound for any single delay (in milliseconds)
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: INITIAL_BACKOFF_MS,
            max_ms: MAX_BACKOFF_MS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each attempt, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_ms);
        Duration::from_millis(ms)
    }
}

/// Settings for the market data sync core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Assets per subscription page
    pub page_size: usize,
    /// Reconnect attempts before falling back to polling
    pub max_reconnect_attempts: u32,
    /// Polling interval while in fallback mode (in seconds)
    pub poll_interval_secs: u64,
    /// Reconnect backoff
    pub backoff: BackoffPolicy,
    /// Quote asset used to build native symbols
    pub quote_asset: String,
    /// HTTP request timeout (in seconds)
    pub request_timeout_secs: u64,
    /// Ranked assets loaded at bootstrap
    pub universe_size: usize,
    pub binance_api_url: String,
    pub binance_ws_url: String,
    pub coingecko_api_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            poll_interval_secs: POLL_INTERVAL_SECS,
            backoff: BackoffPolicy::default(),
            quote_asset: DEFAULT_QUOTE_ASSET.to_string(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            universe_size: DEFAULT_UNIVERSE_SIZE,
            binance_api_url: BINANCE_API_URL.to_string(),
            binance_ws_url: BINANCE_WS_URL.to_string(),
            coingecko_api_url: COINGECKO_API_URL.to_string(),
        }
    }
}

impl SyncConfig {
    /// Loads defaults overridden by `MARKET_SYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "MARKET_SYNC_PAGE_SIZE")? {
            config.page_size = v;
        }
        if let Some(v) = parse_var(&lookup, "MARKET_SYNC_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "MARKET_SYNC_POLL_INTERVAL_SECS")? {
            config.poll_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "MARKET_SYNC_BACKOFF_INITIAL_MS")? {
            config.backoff.initial_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MARKET_SYNC_BACKOFF_MAX_MS")? {
            config.backoff.max_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MARKET_SYNC_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "MARKET_SYNC_UNIVERSE_SIZE")? {
            config.universe_size = v;
        }
        if let Some(v) = lookup("MARKET_SYNC_QUOTE_ASSET") {
            config.quote_asset = v.trim().to_ascii_uppercase();
        }
        if let Some(v) = lookup("MARKET_SYNC_BINANCE_API_URL") {
            config.binance_api_url = v;
        }
        if let Some(v) = lookup("MARKET_SYNC_BINANCE_WS_URL") {
            config.binance_ws_url = v;
        }
        if let Some(v) = lookup("MARKET_SYNC_COINGECKO_API_URL") {
            config.coingecko_api_url = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks every field is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::invalid("page_size", "must be greater than 0"));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_reconnect_attempts",
                "must be greater than 0",
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "poll_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.backoff.initial_ms == 0 {
            return Err(ConfigError::invalid("backoff.initial_ms", "must be greater than 0"));
        }
        if self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ConfigError::invalid(
                "backoff.max_ms",
                format!(
                    "cap {}ms is below initial delay {}ms",
                    self.backoff.max_ms, self.backoff.initial_ms
                ),
            ));
        }
        if self.quote_asset.trim().is_empty() {
            return Err(ConfigError::invalid("quote_asset", "must not be empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse {
                var: var.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}
