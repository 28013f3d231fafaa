//! In-memory price table with connection status and change notification
//!
//! The store publishes immutable snapshots through a `watch` channel. Writers
//! copy-on-write the current snapshot, so readers never block the connection
//! manager and always see a consistent table/status pair.

use crate::{
    constants::EVENT_CHANNEL_CAPACITY,
    error::PriceError,
    types::{
        AssetId, ConnectionStatus, ConnectionStatusPatch, MarketPriceEvent, Page, PriceRecord,
    },
};
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Ranked asset ids that order the table and define its pages
#[derive(Debug, Default, PartialEq)]
struct Ranking {
    ids: Vec<AssetId>,
    positions: HashMap<AssetId, usize>,
}

impl Ranking {
    fn new(ids: Vec<AssetId>) -> Self {
        let mut positions = HashMap::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            positions.entry(id.clone()).or_insert(position);
        }
        Self { ids, positions }
    }

    /// Unranked ids sort after every ranked one
    fn position(&self, asset_id: &AssetId) -> usize {
        self.positions.get(asset_id).copied().unwrap_or(usize::MAX)
    }
}

/// Point-in-time view of the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    /// Prices in rank order; records outside the ranking follow in arrival order
    pub prices: IndexMap<AssetId, PriceRecord>,
    pub status: ConnectionStatus,
    /// Bumped on every mutation
    pub version: u64,
    ranking: Arc<Ranking>,
}

impl StoreSnapshot {
    fn initial(max_reconnect_attempts: u32, ranking: Arc<Ranking>) -> Self {
        Self {
            prices: IndexMap::new(),
            status: ConnectionStatus::new(max_reconnect_attempts),
            version: 0,
            ranking,
        }
    }

    /// Ranked asset ids the pages are cut from
    pub fn ranking(&self) -> &[AssetId] {
        &self.ranking.ids
    }

    /// Records of one page window
    ///
    /// With a ranking the window is taken over the ranked ids, so page `p`
    /// holds the priced assets of ranking window `p` and nothing else.
    /// Without one the table itself is sliced.
    pub fn page(&self, page: Page, page_size: usize) -> Vec<PriceRecord> {
        if self.ranking.ids.is_empty() {
            let range = page.range(page_size, self.prices.len());
            return self.prices.values().skip(range.start).take(range.len()).cloned().collect();
        }

        let range = page.range(page_size, self.ranking.ids.len());
        self.ranking.ids[range]
            .iter()
            .filter_map(|id| self.prices.get(id).cloned())
            .collect()
    }

    fn sort_by_rank(&mut self) {
        let ranking = self.ranking.clone();
        self.prices.sort_by_cached_key(|id, _| ranking.position(id));
    }
}

/// Process-local price table shared by all consumers
pub struct PriceStore {
    state: watch::Sender<Arc<StoreSnapshot>>,
    events: broadcast::Sender<MarketPriceEvent>,
    page_size: usize,
    max_reconnect_attempts: u32,
}

impl PriceStore {
    /// Creates an empty store
    pub fn new(page_size: usize, max_reconnect_attempts: u32) -> Self {
        let (state, _) = watch::channel(Arc::new(StoreSnapshot::initial(
            max_reconnect_attempts,
            Arc::default(),
        )));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            state,
            events,
            page_size,
            max_reconnect_attempts,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Merges a batch of records, last write wins per asset id
    ///
    /// Invalid records are dropped and logged; the rest of the batch still
    /// applies. Returns the number of records accepted.
    pub fn upsert_prices(&self, records: Vec<PriceRecord>) -> usize {
        let mut accepted = Vec::with_capacity(records.len());

        for record in records {
            match record.validate() {
                Ok(()) => accepted.push(record),
                Err(reason) => {
                    tracing::warn!(
                        asset = %record.asset_id,
                        reason = %reason,
                        "Dropping malformed price record"
                    );
                    let _ = self.events.send(MarketPriceEvent::RecordRejected {
                        id: Uuid::new_v4(),
                        asset_id: record.asset_id,
                        reason,
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        if accepted.is_empty() {
            return 0;
        }

        let count = accepted.len();
        let asset_ids: Vec<AssetId> = accepted.iter().map(|r| r.asset_id.clone()).collect();
        let mut update_count = 0;

        self.state.send_modify(|snapshot| {
            let snapshot = Arc::make_mut(snapshot);
            let mut added = false;
            for record in accepted {
                added |= snapshot.prices.insert(record.asset_id.clone(), record).is_none();
            }
            if added {
                snapshot.sort_by_rank();
            }
            snapshot.status.last_update = Some(Utc::now());
            snapshot.status.update_count += 1;
            snapshot.version += 1;
            update_count = snapshot.status.update_count;
        });

        tracing::trace!(count, update_count, "Applied price batch");

        let _ = self.events.send(MarketPriceEvent::PricesUpdated {
            id: Uuid::new_v4(),
            asset_ids,
            update_count,
            timestamp: Utc::now(),
        });

        count
    }

    /// Replaces the ranked asset ids that order the table and cut its pages
    ///
    /// Records already in the table are reordered; none are dropped.
    pub fn set_ranking(&self, ids: Vec<AssetId>) {
        let ranking = Arc::new(Ranking::new(ids));
        let count = ranking.ids.len();

        self.state.send_modify(|snapshot| {
            let snapshot = Arc::make_mut(snapshot);
            snapshot.ranking = ranking;
            snapshot.sort_by_rank();
            snapshot.version += 1;
        });

        tracing::debug!(count, "Price store ranking replaced");
    }

    /// Merges set fields into the connection status
    pub fn set_connection_status(&self, patch: ConnectionStatusPatch) {
        let mut change = None;

        self.state.send_modify(|snapshot| {
            let snapshot = Arc::make_mut(snapshot);
            let from = snapshot.status.state;
            snapshot.status.apply(patch);
            snapshot.version += 1;
            if snapshot.status.state != from {
                change = Some((from, snapshot.status.state, snapshot.status.method));
            }
        });

        if let Some((from, to, method)) = change {
            let _ = self.events.send(MarketPriceEvent::StatusChanged {
                id: Uuid::new_v4(),
                from,
                to,
                method,
                timestamp: Utc::now(),
            });
        }
    }

    /// Clears prices and status back to their initial values
    ///
    /// The ranking is kept.
    pub fn reset(&self) {
        let max = self.max_reconnect_attempts;
        self.state.send_modify(|snapshot| {
            let version = snapshot.version + 1;
            let ranking = snapshot.ranking.clone();
            *snapshot = Arc::new(StoreSnapshot {
                version,
                ..StoreSnapshot::initial(max, ranking)
            });
        });
        tracing::debug!("Price store reset");
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.state.borrow().clone()
    }

    /// All records in rank order
    pub fn get_all(&self) -> Vec<PriceRecord> {
        self.state.borrow().prices.values().cloned().collect()
    }

    /// Records of one ranking window; empty past the last page
    pub fn get_by_page(&self, page: Page) -> Vec<PriceRecord> {
        self.state.borrow().page(page, self.page_size)
    }

    /// Gets the current record for an asset
    pub fn get(&self, asset_id: &AssetId) -> Result<PriceRecord, PriceError> {
        self.state
            .borrow()
            .prices
            .get(asset_id)
            .cloned()
            .ok_or_else(|| PriceError::not_available(asset_id.as_str()))
    }

    /// Number of records in the table
    pub fn len(&self) -> usize {
        self.state.borrow().prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status.clone()
    }

    /// Receiver notified on every mutation
    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.state.subscribe()
    }

    /// Receiver for store events
    pub fn events(&self) -> broadcast::Receiver<MarketPriceEvent> {
        self.events.subscribe()
    }
}
