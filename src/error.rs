//! Error types for the market data sync core

use crate::state::{Action, ConnectionState};
use thiserror::Error;

/// Errors that can occur when talking to an upstream provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network request failed
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// WebSocket transport failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid response from provider
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Asset not supported by this provider
    #[error("Asset not supported: {0}")]
    UnsupportedAsset(String),

    /// Provider API error
    #[error("Provider API error: {0}")]
    ApiError(String),

    /// Timeout waiting for response
    #[error("Request timeout")]
    Timeout,

    /// Stream closed by the remote side
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProviderError {
    /// Returns true for failures worth retrying without operator action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::WebSocket(_)
                | Self::RateLimitExceeded
                | Self::Timeout
                | Self::ConnectionClosed
        )
    }
}

/// Errors that can occur when retrieving price data
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PriceError {
    /// Price data not yet available (never received)
    #[error("Price data not available for {asset}")]
    NotAvailable { asset: String },
}

impl PriceError {
    /// Creates a NotAvailable error
    pub fn not_available(asset: &str) -> Self {
        Self::NotAvailable {
            asset: asset.to_string(),
        }
    }
}

/// Errors returned by connection manager actions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The action is not legal in the manager's current state
    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: Action,
        state: ConnectionState,
    },

    /// Requested page lies beyond the ranked asset list
    #[error("Page {page} is out of range ({pages} pages available)")]
    PageOutOfRange { page: usize, pages: usize },

    /// The manager task is no longer running
    #[error("Connection manager has stopped")]
    ManagerStopped,
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// An environment variable could not be parsed
    #[error("Failed to parse {var}: {value}")]
    Parse { var: String, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors raised while assembling the sync service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The ranked asset provider returned nothing to page over
    #[error("Ranked asset list from {provider} is empty")]
    EmptyUniverse { provider: String },
}
