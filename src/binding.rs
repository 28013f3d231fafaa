//! Read-side views and action forwarding for display code
//!
//! Views are derived from the store's current snapshot. The list views are
//! memoised against the snapshot version, so repeated reads between two
//! mutations hand back the same `Arc` without rebuilding anything.

use crate::{
    config::SyncConfig,
    error::{PriceError, SyncError},
    manager::ConnectionManager,
    metrics::FeedMetrics,
    state::ConnectionState,
    store::{PriceStore, StoreSnapshot},
    types::{
        AssetId, ComponentHealth, ConnectionMethod, ConnectionStatus, HealthStatus,
        MarketPriceEvent, Page, PriceRecord,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Connection status condensed for a status indicator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub state: ConnectionState,
    pub method: ConnectionMethod,
    pub is_connected: bool,
    /// Short human readable label, e.g. `Reconnecting (2/5)`
    pub label: String,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub update_count: u64,
    pub page: Option<Page>,
    pub page_count: usize,
    /// Mapped percentage of the active page
    pub coverage: f64,
    /// Number of active page assets without a native symbol
    pub unmapped: usize,
}

fn status_label(status: &ConnectionStatus) -> String {
    match status.state {
        ConnectionState::Idle => "Offline".to_string(),
        ConnectionState::Connecting => "Connecting".to_string(),
        ConnectionState::Connected => "Live".to_string(),
        ConnectionState::Reconnecting => format!(
            "Reconnecting ({}/{})",
            status.reconnect_attempts, status.max_reconnect_attempts
        ),
        ConnectionState::Failed => "Polling".to_string(),
    }
}

#[derive(Default)]
struct ViewCache {
    all: Option<(u64, Arc<Vec<PriceRecord>>)>,
    pages: HashMap<Page, (u64, Arc<Vec<PriceRecord>>)>,
}

/// Binding between the price store, the connection manager and display code
pub struct MarketDataBinding {
    store: Arc<PriceStore>,
    manager: ConnectionManager,
    stale_after: Duration,
    cache: Mutex<ViewCache>,
}

impl MarketDataBinding {
    /// Creates a binding over an existing store and manager
    ///
    /// Records older than two poll intervals count as stale in health checks.
    pub fn new(store: Arc<PriceStore>, manager: ConnectionManager, config: &SyncConfig) -> Self {
        Self {
            store,
            manager,
            stale_after: config.poll_interval() * 2,
            cache: Mutex::new(ViewCache::default()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, ViewCache> {
        // the cache only holds derived data, a poisoned guard is still usable
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- views --------------------------------------------------------------

    /// All prices in rank order
    pub fn prices(&self) -> Arc<Vec<PriceRecord>> {
        let snapshot = self.store.snapshot();
        let mut cache = self.cache();

        if let Some((version, prices)) = &cache.all {
            if *version == snapshot.version {
                return prices.clone();
            }
        }

        let prices = Arc::new(snapshot.prices.values().cloned().collect::<Vec<_>>());
        cache.all = Some((snapshot.version, prices.clone()));
        prices
    }

    /// Priced assets of one window of the ranked asset list
    pub fn page_prices(&self, page: Page) -> Arc<Vec<PriceRecord>> {
        let snapshot = self.store.snapshot();
        let mut cache = self.cache();

        if let Some((version, prices)) = cache.pages.get(&page) {
            if *version == snapshot.version {
                return prices.clone();
            }
        }

        let prices = Arc::new(snapshot.page(page, self.store.page_size()));
        cache
            .pages
            .retain(|_, (version, _)| *version == snapshot.version);
        cache.pages.insert(page, (snapshot.version, prices.clone()));
        prices
    }

    /// Current price of one asset
    pub fn price(&self, asset_id: &AssetId) -> Result<PriceRecord, PriceError> {
        self.store.get(asset_id)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.store.status()
    }

    /// Status condensed for an indicator widget
    pub fn status_summary(&self) -> StatusSummary {
        let status = self.store.status();
        let resolution = self.manager.resolution();

        StatusSummary {
            label: status_label(&status),
            state: status.state,
            method: status.method,
            is_connected: status.is_connected,
            last_update: status.last_update,
            last_error: status.last_error,
            reconnect_attempts: status.reconnect_attempts,
            max_reconnect_attempts: status.max_reconnect_attempts,
            update_count: status.update_count,
            page: status.page,
            page_count: self.manager.page_count(),
            coverage: resolution.coverage(),
            unmapped: resolution.unmapped.len(),
        }
    }

    /// Assets of the active page that could not be mapped to the exchange
    pub fn unmapped(&self) -> Vec<AssetId> {
        self.manager.unmapped()
    }

    /// Mapped percentage of the active page
    pub fn coverage(&self) -> f64 {
        self.manager.coverage()
    }

    /// Number of pages in the ranked asset list
    pub fn page_count(&self) -> usize {
        self.manager.page_count()
    }

    /// Receiver notified on every store mutation
    pub fn watch(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.store.subscribe()
    }

    /// Receiver for store events
    pub fn events(&self) -> broadcast::Receiver<MarketPriceEvent> {
        self.store.events()
    }

    /// Connect and poll latency metrics
    pub async fn feed_metrics(&self) -> Vec<FeedMetrics> {
        self.manager.metrics().await
    }

    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    // ---- actions ------------------------------------------------------------

    pub async fn start(&self, page: Page) -> Result<(), SyncError> {
        self.manager.start(page).await
    }

    pub async fn stop(&self) -> Result<(), SyncError> {
        self.manager.stop().await
    }

    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.manager.reconnect().await
    }

    pub async fn switch_page(&self, page: Page) -> Result<(), SyncError> {
        self.manager.switch_page(page).await
    }

    /// Stops streaming and ends the manager task
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.manager.shutdown().await
    }

    /// Perform a health check on the sync core
    ///
    /// # Returns
    /// ComponentHealth indicating whether live data is flowing
    pub fn health_check(&self) -> ComponentHealth {
        let snapshot = self.store.snapshot();
        let status = &snapshot.status;
        let mut details = HashMap::new();

        details.insert(
            "available_prices".to_string(),
            serde_json::json!(snapshot.prices.len()),
        );
        details.insert("state".to_string(), serde_json::json!(status.state));
        details.insert("method".to_string(), serde_json::json!(status.method));
        details.insert(
            "reconnect_attempts".to_string(),
            serde_json::json!(status.reconnect_attempts),
        );
        details.insert(
            "update_count".to_string(),
            serde_json::json!(status.update_count),
        );
        details.insert("coverage".to_string(), serde_json::json!(self.coverage()));

        let stale: Vec<&str> = snapshot
            .prices
            .values()
            .filter(|record| record.age() > self.stale_after)
            .map(|record| record.asset_id.as_str())
            .collect();
        details.insert("stale_prices".to_string(), serde_json::json!(stale));

        let status_kind = if status.state == ConnectionState::Idle || snapshot.prices.is_empty() {
            HealthStatus::Unhealthy
        } else if status.state == ConnectionState::Connected && stale.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        let message = match status_kind {
            HealthStatus::Healthy => "Market data stream is live".to_string(),
            HealthStatus::Degraded if status.state == ConnectionState::Failed => {
                "Streaming unavailable, serving polled prices".to_string()
            }
            HealthStatus::Degraded if !stale.is_empty() => {
                format!("Market data has {} stale prices", stale.len())
            }
            HealthStatus::Degraded => format!("Market data stream is {}", status.state),
            HealthStatus::Unhealthy if status.state == ConnectionState::Idle => {
                "Market data sync is not running".to_string()
            }
            HealthStatus::Unhealthy => "No price data available".to_string(),
        };

        ComponentHealth {
            name: "market_data_sync".to_string(),
            status: status_kind,
            message: Some(message),
            details,
            last_checked: Utc::now(),
        }
    }
}
