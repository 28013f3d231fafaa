//! # Market Data Sync
//!
//! Keeps an in-memory table of cryptocurrency prices in sync with an
//! exchange's live ticker stream, falling back to REST polling when the
//! stream cannot be held open.
//!
//! ## Pieces
//!
//! - [`symbols::SymbolMapper`] maps ranked assets to exchange-native symbols
//!   using the exchange's published catalog
//! - [`store::PriceStore`] holds the price table and connection status
//! - [`manager::ConnectionManager`] supervises the stream: subscribe, backoff,
//!   reconnect, page switches and the polling fallback
//! - [`binding::MarketDataBinding`] exposes memoised views and forwards actions
//!
//! ## Usage
//!
//! ```no_run
//! use market_data_sync::{MarketDataSync, Page, SyncConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let binding = MarketDataSync::new(SyncConfig::from_env()?)?
//!     .bootstrap()
//!     .await?;
//!
//! binding.start(Page(0)).await?;
//!
//! let mut changes = binding.watch();
//! while changes.changed().await.is_ok() {
//!     let summary = binding.status_summary();
//!     println!("{} ({} updates)", summary.label, summary.update_count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod config;
pub mod constants;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod provider;
pub mod providers;
pub mod service;
pub mod state;
pub mod store;
pub mod symbols;
pub mod types;

// Re-export commonly used types
pub use binding::{MarketDataBinding, StatusSummary};
pub use config::{BackoffPolicy, SyncConfig};
pub use error::{ConfigError, PriceError, ProviderError, ServiceError, SyncError};
pub use manager::ConnectionManager;
pub use metrics::FeedMetrics;
pub use service::{MarketDataSync, Providers};
pub use state::{Action, ConnectionState};
pub use store::{PriceStore, StoreSnapshot};
pub use symbols::{SymbolMapper, SymbolResolution};
pub use types::{
    Asset, AssetId, ComponentHealth, ConnectionMethod, ConnectionStatus, HealthStatus,
    MarketPriceEvent, NativeSymbol, Page, PriceRecord,
};
