//! Service assembly
//!
//! Wires the live providers, the shared price store and the connection
//! manager together. Each [`MarketDataSync`] owns exactly one store and
//! produces exactly one binding, so the manager stays the store's only writer.
//!
//! # Example
//! ```no_run
//! use market_data_sync::{MarketDataSync, Page, SyncConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sync = MarketDataSync::new(SyncConfig::from_env()?)?;
//! let binding = sync.bootstrap().await?;
//! binding.start(Page(0)).await?;
//!
//! for record in binding.page_prices(Page(0)).iter() {
//!     println!("{}: {}", record.asset_id, record.price);
//! }
//! # Ok(())
//! # }
//! ```

use crate::{
    binding::MarketDataBinding,
    config::SyncConfig,
    error::ServiceError,
    manager::ConnectionManager,
    provider::{RankedAssetProvider, SnapshotProvider, StreamTransport, SymbolCatalogProvider},
    providers::{
        BinanceRestProvider, BinanceStreamTransport, CoinGeckoProvider, FailoverSnapshotProvider,
    },
    store::PriceStore,
    symbols::SymbolMapper,
    types::Asset,
};
use std::sync::Arc;

/// Upstream collaborators of the sync core
#[derive(Clone)]
pub struct Providers {
    /// Exchange symbol catalog
    pub catalog: Arc<dyn SymbolCatalogProvider>,
    /// REST snapshots used while polling
    pub snapshots: Arc<dyn SnapshotProvider>,
    /// Live stream
    pub transport: Arc<dyn StreamTransport>,
    /// Ranked asset list pages are cut from
    pub ranked: Arc<dyn RankedAssetProvider>,
}

impl Providers {
    /// Binance for catalog, stream and primary snapshots; CoinGecko for the
    /// ranked list and as the secondary snapshot source
    pub fn live(config: &SyncConfig) -> Result<Self, ServiceError> {
        let binance = Arc::new(BinanceRestProvider::new(config)?);
        let coingecko = Arc::new(CoinGeckoProvider::new(config)?);
        let snapshot_chain: Vec<Arc<dyn SnapshotProvider>> = vec![
            binance.clone() as Arc<dyn SnapshotProvider>,
            coingecko.clone() as Arc<dyn SnapshotProvider>,
        ];

        Ok(Self {
            catalog: binance,
            snapshots: Arc::new(FailoverSnapshotProvider::new(snapshot_chain)),
            transport: Arc::new(BinanceStreamTransport::new(config)),
            ranked: coingecko,
        })
    }
}

/// Entry point that builds the market data binding
pub struct MarketDataSync {
    config: SyncConfig,
    providers: Providers,
    store: Arc<PriceStore>,
    mapper: Arc<SymbolMapper>,
}

impl MarketDataSync {
    /// Creates the service against the live upstreams
    pub fn new(config: SyncConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let providers = Providers::live(&config)?;
        Ok(Self::with_providers(config, providers))
    }

    /// Creates the service with custom providers
    pub fn with_providers(config: SyncConfig, providers: Providers) -> Self {
        let store = Arc::new(PriceStore::new(
            config.page_size,
            config.max_reconnect_attempts,
        ));
        let mapper = Arc::new(SymbolMapper::new(
            providers.catalog.clone(),
            config.quote_asset.clone(),
        ));

        tracing::debug!(
            catalog = providers.catalog.provider_name(),
            snapshots = providers.snapshots.provider_name(),
            transport = providers.transport.provider_name(),
            ranked = providers.ranked.provider_name(),
            "Market data sync assembled"
        );

        Self {
            config,
            providers,
            store,
            mapper,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    pub fn mapper(&self) -> &Arc<SymbolMapper> {
        &self.mapper
    }

    /// Fetches the ranked asset list once
    pub async fn fetch_universe(&self) -> Result<Vec<Asset>, ServiceError> {
        let ranked = &self.providers.ranked;
        let assets = ranked.fetch_ranked_assets(self.config.universe_size).await?;

        if assets.is_empty() {
            return Err(ServiceError::EmptyUniverse {
                provider: ranked.provider_name().to_string(),
            });
        }

        tracing::info!(
            provider = ranked.provider_name(),
            count = assets.len(),
            "Loaded ranked asset universe"
        );
        Ok(assets)
    }

    /// Loads the ranked universe and returns a binding ready to `start`
    pub async fn bootstrap(self) -> Result<MarketDataBinding, ServiceError> {
        let universe = self.fetch_universe().await?;
        Ok(self.bind(universe))
    }

    /// Spawns the connection manager over `universe` without fetching it
    pub fn bind(self, universe: Vec<Asset>) -> MarketDataBinding {
        let manager = ConnectionManager::spawn(
            self.config.clone(),
            self.store.clone(),
            self.mapper,
            self.providers.transport,
            self.providers.snapshots,
            universe,
        );

        MarketDataBinding::new(self.store, manager, &self.config)
    }
}
