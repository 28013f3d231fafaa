//! Types for the market data sync core

use crate::state::ConnectionState;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use uuid::Uuid;

/// Externally used asset identifier (e.g. a catalog id such as `bitcoin`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Exchange-native ticker symbol, always upper case (e.g. `BTCUSDT`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeSymbol(String);

impl NativeSymbol {
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(symbol.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Websocket stream name for the 24h ticker channel
    pub fn ticker_stream(&self) -> String {
        format!("{}@ticker", self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for NativeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NativeSymbol {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

/// Entry of the ranked asset list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Stable external identifier
    pub id: AssetId,
    /// Display symbol (e.g. `btc`)
    pub symbol: String,
    /// Human readable name
    pub name: String,
    /// Market rank, 1-based when known
    pub rank: Option<u32>,
}

impl Asset {
    pub fn new(id: impl Into<String>, symbol: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: AssetId::new(id),
            symbol: symbol.into(),
            rank: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = Some(rank);
        self
    }
}

/// Current price of a single asset
///
/// Records are replaced whole on every update, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    /// The asset this price belongs to
    pub asset_id: AssetId,

    /// Last traded price
    pub price: Decimal,

    /// 24h price change percentage
    pub change_24h: Decimal,

    /// Last updated timestamp
    pub last_updated: DateTime<Utc>,

    /// Data source
    pub source: String,
}

impl PriceRecord {
    /// Create a new record stamped with the current time
    pub fn new(
        asset_id: AssetId,
        price: Decimal,
        change_24h: Decimal,
        source: impl Into<String>,
    ) -> Self {
        Self {
            asset_id,
            price,
            change_24h,
            last_updated: Utc::now(),
            source: source.into(),
        }
    }

    /// Checks the record is fit for the price table
    pub fn validate(&self) -> Result<(), String> {
        if self.asset_id.as_str().trim().is_empty() {
            return Err("empty asset id".to_string());
        }
        if self.price.is_sign_negative() {
            return Err(format!("negative price {}", self.price));
        }
        Ok(())
    }

    /// Get the age of the record
    pub fn age(&self) -> std::time::Duration {
        let duration = Utc::now().signed_duration_since(self.last_updated);
        std::time::Duration::from_secs(duration.num_seconds().max(0) as u64)
    }
}

/// A 24h ticker event decoded from the stream, keyed by native symbol
#[derive(Debug, Clone, PartialEq)]
pub struct TickerUpdate {
    pub symbol: NativeSymbol,
    pub price: Decimal,
    pub change_24h: Decimal,
}

/// Where prices are currently coming from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMethod {
    #[default]
    Stream,
    Polling,
}

impl fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMethod::Stream => f.write_str("stream"),
            ConnectionMethod::Polling => f.write_str("polling"),
        }
    }
}

/// A fixed-size window over the ranked asset list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Page(pub usize);

impl Page {
    pub fn index(self) -> usize {
        self.0
    }

    /// Index range this page covers in a list of `len` items
    pub fn range(self, page_size: usize, len: usize) -> Range<usize> {
        let start = self.0.saturating_mul(page_size).min(len);
        let end = start.saturating_add(page_size).min(len);
        start..end
    }

    /// Number of pages needed for `len` items
    pub fn count(page_size: usize, len: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        len.div_ceil(page_size)
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection status shared with every consumer of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Lifecycle state of the manager
    pub state: ConnectionState,
    /// True while the live stream is delivering data
    pub is_connected: bool,
    /// Current data source
    pub method: ConnectionMethod,
    /// Time of the last applied price batch
    pub last_update: Option<DateTime<Utc>>,
    /// Most recent failure, cleared on successful connection
    pub last_error: Option<String>,
    /// Consecutive failed attempts in the current failure episode
    pub reconnect_attempts: u32,
    /// Attempts allowed before falling back to polling
    pub max_reconnect_attempts: u32,
    /// Number of price batches applied since the last reset
    pub update_count: u64,
    /// Page currently targeted by the manager
    pub page: Option<Page>,
}

impl ConnectionStatus {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            is_connected: false,
            method: ConnectionMethod::Stream,
            last_update: None,
            last_error: None,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            update_count: 0,
            page: None,
        }
    }

    /// Merges the set fields of `patch` into this status
    pub fn apply(&mut self, patch: ConnectionStatusPatch) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(is_connected) = patch.is_connected {
            self.is_connected = is_connected;
        }
        if let Some(method) = patch.method {
            self.method = method;
        }
        if let Some(last_error) = patch.last_error {
            self.last_error = last_error;
        }
        if let Some(attempts) = patch.reconnect_attempts {
            self.reconnect_attempts = attempts;
        }
        if let Some(max) = patch.max_reconnect_attempts {
            self.max_reconnect_attempts = max;
        }
        if let Some(page) = patch.page {
            self.page = page;
        }
    }
}

/// Partial update for [`ConnectionStatus`]; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatusPatch {
    pub state: Option<ConnectionState>,
    pub is_connected: Option<bool>,
    pub method: Option<ConnectionMethod>,
    pub last_error: Option<Option<String>>,
    pub reconnect_attempts: Option<u32>,
    pub max_reconnect_attempts: Option<u32>,
    pub page: Option<Option<Page>>,
}

impl ConnectionStatusPatch {
    pub fn state(mut self, state: ConnectionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn connected(mut self, is_connected: bool) -> Self {
        self.is_connected = Some(is_connected);
        self
    }

    pub fn method(mut self, method: ConnectionMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = Some(attempts);
        self
    }

    pub fn page(mut self, page: Option<Page>) -> Self {
        self.page = Some(page);
        self
    }
}

/// Market data events for the unified event system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketPriceEvent {
    /// A batch of prices was applied to the store
    PricesUpdated {
        id: Uuid,
        asset_ids: Vec<AssetId>,
        update_count: u64,
        timestamp: DateTime<Utc>,
    },

    /// A record was dropped before reaching the store
    RecordRejected {
        id: Uuid,
        asset_id: AssetId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Connection state or method changed
    StatusChanged {
        id: Uuid,
        from: ConnectionState,
        to: ConnectionState,
        method: ConnectionMethod,
        timestamp: DateTime<Utc>,
    },
}

impl MarketPriceEvent {
    /// Get the event ID
    pub fn id(&self) -> Uuid {
        match self {
            MarketPriceEvent::PricesUpdated { id, .. } => *id,
            MarketPriceEvent::RecordRejected { id, .. } => *id,
            MarketPriceEvent::StatusChanged { id, .. } => *id,
        }
    }

    /// Get the event type as string
    pub fn event_type(&self) -> &'static str {
        match self {
            MarketPriceEvent::PricesUpdated { .. } => "PRICES_UPDATED",
            MarketPriceEvent::RecordRejected { .. } => "RECORD_REJECTED",
            MarketPriceEvent::StatusChanged { .. } => "STATUS_CHANGED",
        }
    }
}

impl fmt::Display for MarketPriceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketPriceEvent::PricesUpdated { asset_ids, .. } => {
                write!(f, "Prices updated for {} assets", asset_ids.len())
            }
            MarketPriceEvent::RecordRejected {
                asset_id, reason, ..
            } => {
                write!(f, "Record for {} rejected: {}", asset_id, reason)
            }
            MarketPriceEvent::StatusChanged {
                from, to, method, ..
            } => {
                write!(f, "Connection {} -> {} ({})", from, to, method)
            }
        }
    }
}

/// Overall system health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Streaming live data
    Healthy,
    /// Reconnecting or serving polled data
    Degraded,
    /// Not running or no data at all
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional status message
    pub message: Option<String>,
    /// Component-specific details
    pub details: std::collections::HashMap<String, serde_json::Value>,
    /// Last checked timestamp
    pub last_checked: DateTime<Utc>,
}
