//! Maps external asset ids to exchange-native symbols
//!
//! A native symbol is the asset's display symbol, upper-cased, followed by the
//! configured quote asset (`btc` → `BTCUSDT`). It only counts as mapped when
//! the exchange catalog actually lists it.

use crate::{
    provider::{PollTarget, SymbolCatalogProvider},
    types::{Asset, AssetId, NativeSymbol},
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Result of mapping a requested asset list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolResolution {
    /// Mapped assets in request order
    pub mapped: IndexMap<AssetId, NativeSymbol>,
    /// Assets with no native symbol, in request order
    pub unmapped: Vec<AssetId>,
    by_native: HashMap<NativeSymbol, AssetId>,
}

impl SymbolResolution {
    /// Number of distinct assets that were requested
    pub fn requested(&self) -> usize {
        self.mapped.len() + self.unmapped.len()
    }

    /// Percentage of requested assets that mapped, rounded to one decimal.
    /// An empty request has 0 coverage.
    pub fn coverage(&self) -> f64 {
        let requested = self.requested();
        if requested == 0 {
            return 0.0;
        }
        let pct = self.mapped.len() as f64 / requested as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }

    /// Native symbols to subscribe, in request order
    pub fn symbols(&self) -> Vec<NativeSymbol> {
        self.mapped.values().cloned().collect()
    }

    /// Asset id a stream symbol belongs to
    pub fn asset_for(&self, symbol: &NativeSymbol) -> Option<&AssetId> {
        self.by_native.get(symbol)
    }

    /// Every requested asset with its native symbol when mapped
    pub fn poll_targets(&self) -> Vec<PollTarget> {
        self.mapped
            .iter()
            .map(|(id, native)| PollTarget {
                asset_id: id.clone(),
                native: Some(native.clone()),
            })
            .chain(self.unmapped.iter().map(|id| PollTarget {
                asset_id: id.clone(),
                native: None,
            }))
            .collect()
    }

    /// Resolves `assets` against an already loaded catalog
    ///
    /// Duplicate asset ids are resolved once. When two assets share a native
    /// symbol the earlier (higher ranked) one keeps it and the later one is
    /// reported unmapped.
    pub fn against_catalog(
        assets: &[Asset],
        catalog: &HashSet<NativeSymbol>,
        quote_asset: &str,
    ) -> Self {
        let mut resolution = Self::default();
        let mut seen = HashSet::new();

        for asset in assets {
            if !seen.insert(asset.id.clone()) {
                continue;
            }

            let candidate = native_candidate(asset, quote_asset);
            match candidate {
                Some(native)
                    if catalog.contains(&native)
                        && !resolution.by_native.contains_key(&native) =>
                {
                    resolution
                        .by_native
                        .insert(native.clone(), asset.id.clone());
                    resolution.mapped.insert(asset.id.clone(), native);
                }
                _ => resolution.unmapped.push(asset.id.clone()),
            }
        }

        resolution
    }

    /// Every asset unmapped, used when no catalog is available
    pub fn all_unmapped(assets: &[Asset]) -> Self {
        let mut seen = HashSet::new();
        Self {
            unmapped: assets
                .iter()
                .filter(|a| seen.insert(a.id.clone()))
                .map(|a| a.id.clone())
                .collect(),
            ..Self::default()
        }
    }
}

/// Candidate native symbol for an asset, `None` for a blank display symbol
pub fn native_candidate(asset: &Asset, quote_asset: &str) -> Option<NativeSymbol> {
    let base = asset.symbol.trim();
    if base.is_empty() {
        return None;
    }
    Some(NativeSymbol::new(format!("{}{}", base, quote_asset.trim())))
}

/// Resolves asset ids to native symbols using a lazily fetched catalog
pub struct SymbolMapper {
    provider: Arc<dyn SymbolCatalogProvider>,
    catalog: OnceCell<HashSet<NativeSymbol>>,
    quote_asset: String,
}

impl SymbolMapper {
    pub fn new(provider: Arc<dyn SymbolCatalogProvider>, quote_asset: impl Into<String>) -> Self {
        Self {
            provider,
            catalog: OnceCell::new(),
            quote_asset: quote_asset.into().trim().to_ascii_uppercase(),
        }
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    /// True once the catalog has been fetched successfully
    pub fn is_catalog_loaded(&self) -> bool {
        self.catalog.initialized()
    }

    /// Loads the catalog on first use; failures are not cached
    async fn catalog(&self) -> Option<&HashSet<NativeSymbol>> {
        let result = self
            .catalog
            .get_or_try_init(|| async {
                let catalog = self.provider.fetch_symbol_catalog().await?;
                tracing::info!(
                    provider = self.provider.provider_name(),
                    symbols = catalog.len(),
                    "Loaded exchange symbol catalog"
                );
                Ok::<_, crate::error::ProviderError>(catalog)
            })
            .await;

        match result {
            Ok(catalog) => Some(catalog),
            Err(e) => {
                tracing::warn!(
                    provider = self.provider.provider_name(),
                    error = %e,
                    "Symbol catalog unavailable, treating all assets as unmapped"
                );
                None
            }
        }
    }

    /// Maps `assets` to native symbols
    ///
    /// Never fails: without a catalog every asset is reported unmapped.
    pub async fn resolve(&self, assets: &[Asset]) -> SymbolResolution {
        let resolution = match self.catalog().await {
            Some(catalog) => SymbolResolution::against_catalog(assets, catalog, &self.quote_asset),
            None => SymbolResolution::all_unmapped(assets),
        };

        if !resolution.unmapped.is_empty() {
            tracing::debug!(
                unmapped = ?resolution.unmapped,
                coverage = resolution.coverage(),
                "Some assets have no native symbol"
            );
        }

        resolution
    }

    /// Mapped percentage of `assets`, 0 for an empty list
    pub async fn coverage(&self, assets: &[Asset]) -> f64 {
        self.resolve(assets).await.coverage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockCatalog;

    fn assets() -> Vec<Asset> {
        vec![Asset::new("A", "a"), Asset::new("B", "b"), Asset::new("C", "c")]
    }

    #[tokio::test]
    async fn test_resolve_partial_catalog() {
        let mapper = SymbolMapper::new(Arc::new(MockCatalog::new(["AUSD", "BUSD"])), "usd");

        let resolution = mapper.resolve(&assets()).await;

        assert_eq!(resolution.mapped.len(), 2);
        assert_eq!(resolution.mapped[&AssetId::new("A")], NativeSymbol::new("AUSD"));
        assert_eq!(resolution.mapped[&AssetId::new("B")], NativeSymbol::new("BUSD"));
        assert_eq!(resolution.unmapped, vec![AssetId::new("C")]);
        assert_eq!(resolution.coverage(), 66.7);
        assert_eq!(
            resolution.asset_for(&NativeSymbol::new("BUSD")),
            Some(&AssetId::new("B"))
        );
    }

    #[tokio::test]
    async fn test_catalog_fetched_once() {
        let catalog = Arc::new(MockCatalog::new(["AUSDT"]));
        let mapper = SymbolMapper::new(catalog.clone(), "USDT");

        mapper.resolve(&assets()).await;
        mapper.resolve(&assets()).await;
        mapper.coverage(&assets()).await;

        assert_eq!(catalog.call_count(), 1);
        assert!(mapper.is_catalog_loaded());
    }

    #[tokio::test]
    async fn test_catalog_failure_marks_everything_unmapped() {
        let catalog = Arc::new(MockCatalog::failing());
        let mapper = SymbolMapper::new(catalog.clone(), "USDT");

        let resolution = mapper.resolve(&assets()).await;
        assert!(resolution.mapped.is_empty());
        assert_eq!(resolution.unmapped.len(), 3);
        assert_eq!(resolution.coverage(), 0.0);
        assert!(!mapper.is_catalog_loaded());

        // a later call retries the fetch
        catalog.set_failing(false);
        mapper.resolve(&assets()).await;
        assert_eq!(catalog.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_request_has_zero_coverage() {
        let mapper = SymbolMapper::new(Arc::new(MockCatalog::new(["AUSDT"])), "USDT");
        assert_eq!(mapper.coverage(&[]).await, 0.0);
    }

    #[test]
    fn test_duplicate_ids_and_shared_symbols() {
        let catalog: HashSet<NativeSymbol> = ["ETHUSDT"].into_iter().map(NativeSymbol::new).collect();
        let assets = vec![
            Asset::new("ethereum", "eth"),
            Asset::new("ethereum", "eth"),
            Asset::new("ether-clone", "ETH"),
            Asset::new("blank", "  "),
        ];

        let resolution = SymbolResolution::against_catalog(&assets, &catalog, "USDT");

        assert_eq!(resolution.mapped.len(), 1);
        assert_eq!(
            resolution.unmapped,
            vec![AssetId::new("ether-clone"), AssetId::new("blank")]
        );
        assert_eq!(resolution.requested(), 3);
    }

    #[test]
    fn test_poll_targets_cover_unmapped_assets() {
        let catalog: HashSet<NativeSymbol> = ["AUSDT"].into_iter().map(NativeSymbol::new).collect();
        let resolution = SymbolResolution::against_catalog(&assets(), &catalog, "USDT");

        let targets = resolution.poll_targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].native, Some(NativeSymbol::new("AUSDT")));
        assert!(targets[1..].iter().all(|t| t.native.is_none()));
    }
}
