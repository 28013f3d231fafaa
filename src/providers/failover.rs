//! Failover snapshot provider implementation

use crate::{
    error::ProviderError,
    provider::{PollTarget, SnapshotProvider},
    types::PriceRecord,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Snapshot provider that asks each inner provider in order
///
/// Later providers are only consulted for targets the earlier ones could not
/// price, so an exchange that knows half the page does not hide the other
/// half from the secondary source.
pub struct FailoverSnapshotProvider {
    providers: Vec<Arc<dyn SnapshotProvider>>,
}

impl FailoverSnapshotProvider {
    /// Creates a new failover provider; providers are tried in the given order
    pub fn new(providers: Vec<Arc<dyn SnapshotProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl SnapshotProvider for FailoverSnapshotProvider {
    async fn fetch_snapshots(
        &self,
        targets: &[PollTarget],
    ) -> Result<Vec<PriceRecord>, ProviderError> {
        let mut remaining: Vec<PollTarget> = targets.to_vec();
        let mut result = Vec::new();
        let mut last_error = None;

        for provider in &self.providers {
            if remaining.is_empty() {
                break;
            }

            match provider.fetch_snapshots(&remaining).await {
                Ok(prices) => {
                    let priced: HashSet<_> = prices.iter().map(|p| p.asset_id.clone()).collect();
                    remaining.retain(|t| !priced.contains(&t.asset_id));
                    result.extend(prices);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.provider_name(),
                        error = %e,
                        "Snapshot provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        if result.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        Ok(result)
    }

    fn provider_name(&self) -> &'static str {
        "failover"
    }
}
