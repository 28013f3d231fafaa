//! Provider abstractions for the upstream services the sync core talks to
//!
//! The connection manager only sees these traits: a symbol catalog, a REST
//! snapshot source, a ranked asset list and a streaming transport. Concrete
//! exchanges live in [`crate::providers`].

use crate::{
    error::ProviderError,
    types::{Asset, AssetId, NativeSymbol, PriceRecord, TickerUpdate},
};
use async_trait::async_trait;
use std::collections::HashSet;

/// Source of the exchange's published symbol catalog
#[async_trait]
pub trait SymbolCatalogProvider: Send + Sync {
    /// Fetches every native symbol the exchange currently lists
    async fn fetch_symbol_catalog(&self) -> Result<HashSet<NativeSymbol>, ProviderError>;

    /// Returns the name of this provider
    fn provider_name(&self) -> &'static str;
}

/// An asset to poll, with its native symbol when one was mapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub asset_id: AssetId,
    pub native: Option<NativeSymbol>,
}

/// REST source of current price snapshots
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Fetches current prices for the given targets
    ///
    /// Targets the provider cannot price are skipped; an empty result is not
    /// an error.
    async fn fetch_snapshots(
        &self,
        targets: &[PollTarget],
    ) -> Result<Vec<PriceRecord>, ProviderError>;

    /// Returns the name of this provider
    fn provider_name(&self) -> &'static str;
}

/// Source of the ranked asset list that pages are cut from
#[async_trait]
pub trait RankedAssetProvider: Send + Sync {
    /// Fetches up to `limit` assets ordered by rank
    async fn fetch_ranked_assets(&self, limit: usize) -> Result<Vec<Asset>, ProviderError>;

    /// Returns the name of this provider
    fn provider_name(&self) -> &'static str;
}

/// Message received on a live stream session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Price update for one native symbol
    Ticker(TickerUpdate),
    /// The exchange confirmed a subscribe/unsubscribe request
    SubscriptionAck { request_id: u64 },
    /// Payload that could not be decoded
    Malformed(String),
}

/// An open stream connection
#[async_trait]
pub trait StreamSession: Send {
    /// Subscribes to the ticker channel of each symbol
    async fn subscribe(
        &mut self,
        symbols: &[NativeSymbol],
        request_id: u64,
    ) -> Result<(), ProviderError>;

    /// Drops the ticker channel of each symbol
    async fn unsubscribe(
        &mut self,
        symbols: &[NativeSymbol],
        request_id: u64,
    ) -> Result<(), ProviderError>;

    /// Waits for the next event. `None` means the remote closed the session.
    ///
    /// Must be cancel safe: the manager polls it inside `tokio::select!`.
    async fn next_event(&mut self) -> Option<Result<StreamEvent, ProviderError>>;

    /// Closes the session
    async fn close(&mut self);
}

/// Opens stream sessions
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a new session with no subscriptions
    async fn connect(&self) -> Result<Box<dyn StreamSession>, ProviderError>;

    /// Returns the name of this provider
    fn provider_name(&self) -> &'static str;
}
