//! CoinGecko provider: ranked asset universe and id-based price snapshots

use super::{http_client, read_json, send_error};
use crate::{
    config::SyncConfig,
    constants::COINGECKO_MARKETS_ENDPOINT,
    error::ProviderError,
    provider::{PollTarget, RankedAssetProvider, SnapshotProvider},
    types::{Asset, AssetId, PriceRecord},
};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

/// Most entries CoinGecko returns per markets page
const MAX_PER_PAGE: usize = 250;

/// CoinGecko `/coins/markets` entry
#[derive(Debug, Deserialize)]
struct MarketEntry {
    id: String,
    symbol: String,
    name: String,
    current_price: Option<f64>,
    market_cap_rank: Option<u32>,
    price_change_percentage_24h: Option<f64>,
}

/// CoinGecko price provider
pub struct CoinGeckoProvider {
    client: Client,
    base_url: String,
}

impl CoinGeckoProvider {
    pub const NAME: &'static str = "coingecko";

    /// Creates a provider for the configured CoinGecko endpoint
    pub fn new(config: &SyncConfig) -> Result<Self, ProviderError> {
        Self::with_base_url(&config.coingecko_api_url, config.request_timeout())
    }

    /// Creates a provider against an explicit base URL
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_markets(
        &self,
        query: &[(&str, String)],
    ) -> Result<Vec<MarketEntry>, ProviderError> {
        let url = format!("{}{}", self.base_url, COINGECKO_MARKETS_ENDPOINT);
        tracing::debug!(url = %url, query = ?query, "Fetching CoinGecko markets");

        let response = self
            .client
            .get(&url)
            .query(&[("vs_currency", "usd"), ("order", "market_cap_desc")])
            .query(query)
            .send()
            .await
            .map_err(send_error)?;

        read_json(response, Self::NAME).await
    }

    /// Converts a market entry into a record, `None` without a usable price
    fn to_record(&self, entry: &MarketEntry) -> Option<PriceRecord> {
        let price = entry.current_price.and_then(|p| Decimal::try_from(p).ok())?;
        let change = entry
            .price_change_percentage_24h
            .and_then(|c| Decimal::try_from(c).ok())
            .unwrap_or_default();

        Some(PriceRecord::new(
            AssetId::new(&entry.id),
            price.normalize(),
            change.round_dp(4),
            Self::NAME,
        ))
    }
}

#[async_trait]
impl RankedAssetProvider for CoinGeckoProvider {
    async fn fetch_ranked_assets(&self, limit: usize) -> Result<Vec<Asset>, ProviderError> {
        let mut assets = Vec::with_capacity(limit);
        let mut page = 1;

        while assets.len() < limit {
            let per_page = (limit - assets.len()).min(MAX_PER_PAGE);
            let entries = self
                .fetch_markets(&[
                    ("per_page", per_page.to_string()),
                    ("page", page.to_string()),
                ])
                .await?;
            let exhausted = entries.len() < per_page;

            assets.extend(entries.into_iter().map(|e| {
                let asset = Asset::new(e.id, e.symbol).with_name(e.name);
                match e.market_cap_rank {
                    Some(rank) => asset.with_rank(rank),
                    None => asset,
                }
            }));

            if exhausted {
                break;
            }
            page += 1;
        }

        assets.truncate(limit);
        tracing::info!(count = assets.len(), "Loaded ranked asset universe");
        Ok(assets)
    }

    fn provider_name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl SnapshotProvider for CoinGeckoProvider {
    async fn fetch_snapshots(
        &self,
        targets: &[PollTarget],
    ) -> Result<Vec<PriceRecord>, ProviderError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut prices = Vec::with_capacity(targets.len());

        // one markets page holds at most MAX_PER_PAGE entries
        for chunk in targets.chunks(MAX_PER_PAGE) {
            let ids = chunk
                .iter()
                .map(|t| t.asset_id.as_str())
                .collect::<Vec<_>>()
                .join(",");

            let entries = self
                .fetch_markets(&[("ids", ids), ("per_page", chunk.len().to_string())])
                .await?;
            prices.extend(entries.iter().filter_map(|e| self.to_record(e)));
        }

        tracing::debug!(
            requested = targets.len(),
            count = prices.len(),
            "Fetched CoinGecko snapshots"
        );

        Ok(prices)
    }

    fn provider_name(&self) -> &'static str {
        Self::NAME
    }
}
