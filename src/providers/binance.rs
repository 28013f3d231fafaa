//! Binance REST provider: symbol catalog and 24h ticker snapshots

use super::{http_client, read_json, send_error};
use crate::{
    config::SyncConfig,
    constants::{BINANCE_EXCHANGE_INFO_ENDPOINT, BINANCE_TICKER_ENDPOINT},
    error::ProviderError,
    provider::{PollTarget, SnapshotProvider, SymbolCatalogProvider},
    types::{AssetId, NativeSymbol, PriceRecord},
};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

/// Binance `exchangeInfo` response (only the fields we need)
#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
}

/// Binance 24h ticker entry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    last_price: String,
    price_change_percent: String,
}

/// Binance REST provider
pub struct BinanceRestProvider {
    client: Client,
    base_url: String,
}

impl BinanceRestProvider {
    pub const NAME: &'static str = "binance";

    /// Creates a provider for the configured Binance REST endpoint
    pub fn new(config: &SyncConfig) -> Result<Self, ProviderError> {
        Self::with_base_url(&config.binance_api_url, config.request_timeout())
    }

    /// Creates a provider against an explicit base URL
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Converts ticker entries into records for the requested targets
    fn parse_tickers(
        &self,
        tickers: Vec<Ticker24h>,
        by_native: &HashMap<NativeSymbol, AssetId>,
    ) -> Vec<PriceRecord> {
        let mut result = Vec::with_capacity(tickers.len());

        for ticker in tickers {
            let native = NativeSymbol::new(&ticker.symbol);
            let Some(asset_id) = by_native.get(&native) else {
                continue;
            };

            match (
                Decimal::from_str(&ticker.last_price),
                Decimal::from_str(&ticker.price_change_percent),
            ) {
                (Ok(price), Ok(change)) => result.push(PriceRecord::new(
                    asset_id.clone(),
                    price,
                    change,
                    Self::NAME,
                )),
                _ => tracing::warn!(
                    symbol = %ticker.symbol,
                    price = %ticker.last_price,
                    change = %ticker.price_change_percent,
                    "Skipping unparseable Binance ticker"
                ),
            }
        }

        result
    }
}

#[async_trait]
impl SymbolCatalogProvider for BinanceRestProvider {
    async fn fetch_symbol_catalog(&self) -> Result<HashSet<NativeSymbol>, ProviderError> {
        let url = format!("{}{}", self.base_url, BINANCE_EXCHANGE_INFO_ENDPOINT);
        tracing::debug!(url = %url, "Fetching Binance symbol catalog");

        let response = self.client.get(&url).send().await.map_err(send_error)?;
        let info: ExchangeInfo = read_json(response, Self::NAME).await?;

        let catalog: HashSet<NativeSymbol> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING")
            .map(|s| NativeSymbol::new(s.symbol))
            .collect();

        if catalog.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "Binance returned an empty symbol catalog".to_string(),
            ));
        }

        Ok(catalog)
    }

    fn provider_name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl SnapshotProvider for BinanceRestProvider {
    async fn fetch_snapshots(
        &self,
        targets: &[PollTarget],
    ) -> Result<Vec<PriceRecord>, ProviderError> {
        let by_native: HashMap<NativeSymbol, AssetId> = targets
            .iter()
            .filter_map(|t| t.native.clone().map(|n| (n, t.asset_id.clone())))
            .collect();

        if by_native.is_empty() {
            return Ok(Vec::new());
        }

        let symbols: Vec<&str> = by_native.keys().map(NativeSymbol::as_str).collect();
        let symbols_param = serde_json::to_string(&symbols)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let url = format!("{}{}", self.base_url, BINANCE_TICKER_ENDPOINT);

        tracing::debug!(count = symbols.len(), "Fetching Binance ticker snapshots");

        let response = self
            .client
            .get(&url)
            .query(&[("symbols", symbols_param)])
            .send()
            .await
            .map_err(send_error)?;
        let tickers: Vec<Ticker24h> = read_json(response, Self::NAME).await?;

        let prices = self.parse_tickers(tickers, &by_native);
        tracing::debug!(count = prices.len(), "Fetched Binance snapshots");

        Ok(prices)
    }

    fn provider_name(&self) -> &'static str {
        Self::NAME
    }
}
