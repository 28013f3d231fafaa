//! Stream connection manager
//!
//! Owns the lifecycle of the live feed for one page of the ranked asset list.
//! All mutable connection state lives in a single actor task; the cloneable
//! [`ConnectionManager`] handle sends it commands and reads shared state.
//!
//! ## Staleness
//!
//! Work that may outlive the request that started it carries a sequence tag:
//!
//! - symbol resolution and poll fetches carry the page / poll sequence
//! - connect attempts carry the connection sequence
//!
//! `start`, `switch_page`, `reconnect` and `stop` bump the relevant sequence
//! and abort the in-flight task, so a response that still lands afterwards is
//! recognised as superseded and discarded.

use crate::{
    config::SyncConfig,
    constants::COMMAND_CHANNEL_CAPACITY,
    error::{ProviderError, SyncError},
    metrics::{FeedMetrics, MetricsCollector},
    provider::{SnapshotProvider, StreamEvent, StreamSession, StreamTransport},
    state::{Action, ConnectionState},
    store::PriceStore,
    symbols::{SymbolMapper, SymbolResolution},
    types::{
        Asset, AssetId, ConnectionMethod, ConnectionStatus, ConnectionStatusPatch, NativeSymbol,
        Page, PriceRecord, TickerUpdate,
    },
};
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{Interval, MissedTickBehavior, Sleep};

type Reply = oneshot::Sender<Result<(), SyncError>>;

enum Command {
    Start { page: Page, reply: Reply },
    Stop { reply: Reply },
    Reconnect { reply: Reply },
    SwitchPage { page: Page, reply: Reply },
    SetUniverse { assets: Vec<Asset>, reply: Reply },
    Shutdown { reply: Reply },
}

/// Output of a background task, tagged for staleness checks
enum TaskOutput {
    Resolved {
        seq: u64,
        resolution: SymbolResolution,
    },
    Connected {
        seq: u64,
        elapsed: Duration,
        result: Result<Box<dyn StreamSession>, ProviderError>,
    },
    Polled {
        seq: u64,
        elapsed: Duration,
        result: Result<Vec<PriceRecord>, ProviderError>,
    },
}

/// Connect and poll latency collectors
struct ManagerMetrics {
    connect: MetricsCollector,
    poll: MetricsCollector,
}

/// Handle to the connection manager task
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    store: Arc<PriceStore>,
    resolution: watch::Receiver<Arc<SymbolResolution>>,
    universe: watch::Receiver<Arc<Vec<Asset>>>,
    metrics: Arc<ManagerMetrics>,
    page_size: usize,
}

impl ConnectionManager {
    /// Spawns the manager task on the current tokio runtime
    ///
    /// `universe` is the ranked asset list pages are cut from.
    pub fn spawn(
        config: SyncConfig,
        store: Arc<PriceStore>,
        mapper: Arc<SymbolMapper>,
        transport: Arc<dyn StreamTransport>,
        poller: Arc<dyn SnapshotProvider>,
        universe: Vec<Asset>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (resolution_tx, resolution) = watch::channel(Arc::new(SymbolResolution::default()));
        let ranking: Vec<_> = universe.iter().map(|a| a.id.clone()).collect();
        let (universe_tx, universe_rx) = watch::channel(Arc::new(universe));
        let metrics = Arc::new(ManagerMetrics {
            connect: MetricsCollector::new("connect"),
            poll: MetricsCollector::new("poll"),
        });
        let page_size = config.page_size;

        store.set_connection_status(ConnectionStatusPatch {
            max_reconnect_attempts: Some(config.max_reconnect_attempts),
            ..ConnectionStatusPatch::default()
        });
        store.set_ranking(ranking);

        let worker = Worker {
            config,
            store: store.clone(),
            mapper,
            transport,
            poller,
            metrics: metrics.clone(),
            universe: universe_tx,
            resolution: resolution_tx,
            state: ConnectionState::Idle,
            attempts: 0,
            page: None,
            resolved: false,
            page_seq: 0,
            conn_seq: 0,
            poll_seq: 0,
            request_seq: 0,
            session: None,
            subscribed: Vec::new(),
            reconnect_timer: None,
            poll_timer: None,
            tasks: JoinSet::new(),
            resolve_task: None,
            connect_task: None,
            poll_task: None,
        };

        tokio::spawn(worker.run(command_rx));

        Self {
            commands,
            store,
            resolution,
            universe: universe_rx,
            metrics,
            page_size,
        }
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::ManagerStopped)?;
        rx.await.map_err(|_| SyncError::ManagerStopped)?
    }

    /// Starts streaming `page`, replacing whatever was running
    pub async fn start(&self, page: Page) -> Result<(), SyncError> {
        self.request(|reply| Command::Start { page, reply }).await
    }

    /// Tears everything down and returns to idle. Idempotent.
    pub async fn stop(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Resets the attempt counter and retries the stream
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Moves the subscription (or polling target set) to another page
    pub async fn switch_page(&self, page: Page) -> Result<(), SyncError> {
        self.request(|reply| Command::SwitchPage { page, reply }).await
    }

    /// Replaces the ranked asset list; an active page is re-resolved
    ///
    /// An active page past the end of the new list moves to its last page,
    /// or stops the feed when the new list is empty.
    pub async fn set_universe(&self, assets: Vec<Asset>) -> Result<(), SyncError> {
        self.request(|reply| Command::SetUniverse { assets, reply }).await
    }

    /// Stops and ends the manager task
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.store.status()
    }

    /// Symbol resolution of the active page
    pub fn resolution(&self) -> Arc<SymbolResolution> {
        self.resolution.borrow().clone()
    }

    /// Assets of the active page without a native symbol
    pub fn unmapped(&self) -> Vec<AssetId> {
        self.resolution.borrow().unmapped.clone()
    }

    /// Mapping coverage of the active page
    pub fn coverage(&self) -> f64 {
        self.resolution.borrow().coverage()
    }

    /// Ranked asset list
    pub fn universe(&self) -> Arc<Vec<Asset>> {
        self.universe.borrow().clone()
    }

    /// Number of pages in the ranked asset list
    pub fn page_count(&self) -> usize {
        Page::count(self.page_size, self.universe.borrow().len())
    }

    /// Receiver notified whenever the active page resolves
    pub fn watch_resolution(&self) -> watch::Receiver<Arc<SymbolResolution>> {
        self.resolution.clone()
    }

    /// Connect and poll metrics
    pub async fn metrics(&self) -> Vec<FeedMetrics> {
        vec![
            self.metrics.connect.snapshot().await,
            self.metrics.poll.snapshot().await,
        ]
    }
}

/// The actor owning all connection state
struct Worker {
    config: SyncConfig,
    store: Arc<PriceStore>,
    mapper: Arc<SymbolMapper>,
    transport: Arc<dyn StreamTransport>,
    poller: Arc<dyn SnapshotProvider>,
    metrics: Arc<ManagerMetrics>,
    universe: watch::Sender<Arc<Vec<Asset>>>,
    resolution: watch::Sender<Arc<SymbolResolution>>,

    state: ConnectionState,
    attempts: u32,
    page: Option<Page>,
    /// True once `resolution` belongs to the current page sequence
    resolved: bool,

    page_seq: u64,
    conn_seq: u64,
    poll_seq: u64,
    request_seq: u64,

    session: Option<Box<dyn StreamSession>>,
    subscribed: Vec<NativeSymbol>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    poll_timer: Option<Interval>,

    tasks: JoinSet<TaskOutput>,
    resolve_task: Option<AbortHandle>,
    connect_task: Option<AbortHandle>,
    poll_task: Option<AbortHandle>,
}

async fn next_stream_event(
    session: &mut Option<Box<dyn StreamSession>>,
) -> Option<Result<StreamEvent, ProviderError>> {
    match session {
        Some(session) => session.next_event().await,
        None => pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn poll_due(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!(
            transport = self.transport.provider_name(),
            poller = self.poller.provider_name(),
            "Connection manager started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_task(joined).await;
                }
                event = next_stream_event(&mut self.session) => {
                    self.handle_stream_event(event).await;
                }
                _ = reconnect_due(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    if self.state == ConnectionState::Reconnecting {
                        self.attempt_connect();
                    }
                }
                _ = poll_due(&mut self.poll_timer) => {
                    self.spawn_poll();
                }
            }
        }

        tracing::debug!("Connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Start { page, reply } => (self.start(page).await, reply),
            Command::Stop { reply } => {
                self.stop().await;
                (Ok(()), reply)
            }
            Command::Reconnect { reply } => (self.reconnect().await, reply),
            Command::SwitchPage { page, reply } => (self.switch_page(page), reply),
            Command::SetUniverse { assets, reply } => {
                self.set_universe(assets).await;
                (Ok(()), reply)
            }
            Command::Shutdown { reply } => (Ok(()), reply),
        };

        if let Err(e) = &result {
            tracing::warn!(error = %e, state = %self.state, "Rejected connection manager action");
        }
        let _ = reply.send(result);
    }

    // ---- actions ------------------------------------------------------------

    async fn start(&mut self, page: Page) -> Result<(), SyncError> {
        self.check_page(page)?;

        if self.state.is_active() {
            self.halt().await;
            self.transition(ConnectionState::Idle);
        }

        tracing::info!(page = %page, "Starting market data stream");
        self.page = Some(page);
        self.attempts = 0;
        self.transition(ConnectionState::Connecting);
        self.begin_resolve();
        self.attempt_connect();
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state == ConnectionState::Idle && self.tasks.is_empty() {
            return;
        }

        self.halt().await;
        self.page = None;
        self.attempts = 0;
        self.resolved = false;
        self.resolution.send_replace(Arc::new(SymbolResolution::default()));
        self.transition(ConnectionState::Idle);
        tracing::info!("Market data stream stopped");
    }

    async fn reconnect(&mut self) -> Result<(), SyncError> {
        self.permit(Action::Reconnect)?;

        self.halt().await;
        self.attempts = 0;
        tracing::info!(page = ?self.page, "Manual reconnect requested");
        self.transition(ConnectionState::Connecting);
        // re-resolve as well: a catalog that failed earlier gets another chance
        self.begin_resolve();
        self.attempt_connect();
        Ok(())
    }

    fn switch_page(&mut self, page: Page) -> Result<(), SyncError> {
        self.permit(Action::SwitchPage)?;
        self.check_page(page)?;

        tracing::info!(from = ?self.page, to = %page, state = %self.state, "Switching page");
        self.page = Some(page);
        self.store
            .set_connection_status(ConnectionStatusPatch::default().page(self.page));
        self.begin_resolve();
        Ok(())
    }

    async fn set_universe(&mut self, assets: Vec<Asset>) {
        tracing::info!(count = assets.len(), "Asset universe replaced");
        self.store.set_ranking(assets.iter().map(|a| a.id.clone()).collect());
        let pages = Page::count(self.config.page_size, assets.len());
        self.universe.send_replace(Arc::new(assets));

        if !self.state.is_active() {
            return;
        }

        if let Some(page) = self.page.filter(|p| p.index() >= pages) {
            let Some(last) = pages.checked_sub(1) else {
                tracing::warn!(page = %page, "Asset universe is empty, stopping stream");
                self.stop().await;
                return;
            };
            tracing::warn!(
                from = %page,
                to = last,
                pages,
                "Active page past the new universe, moving to its last page"
            );
            self.page = Some(Page(last));
            self.store
                .set_connection_status(ConnectionStatusPatch::default().page(self.page));
        }
        self.begin_resolve();
    }

    fn permit(&self, action: Action) -> Result<(), SyncError> {
        if self.state.permits(action) {
            Ok(())
        } else {
            Err(SyncError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }

    fn check_page(&self, page: Page) -> Result<(), SyncError> {
        let pages = Page::count(self.config.page_size, self.universe.borrow().len());
        if page.index() >= pages {
            return Err(SyncError::PageOutOfRange {
                page: page.index(),
                pages,
            });
        }
        Ok(())
    }

    // ---- state machine ------------------------------------------------------

    /// The single place the connection state changes
    ///
    /// Also publishes the resulting status to the store. Re-entering the
    /// current state only refreshes the status fields.
    fn transition(&mut self, next: ConnectionState) {
        let from = self.state;
        if from != next {
            let allowed = from.can_transition_to(next);
            debug_assert!(allowed, "illegal connection transition {} -> {}", from, next);
            if !allowed {
                tracing::error!(from = %from, to = %next, "Illegal connection transition ignored");
                return;
            }
            tracing::info!(
                from = %from,
                to = %next,
                attempts = self.attempts,
                "Connection state changed"
            );
        }
        self.state = next;

        let mut patch = ConnectionStatusPatch::default()
            .state(next)
            .connected(next == ConnectionState::Connected)
            .attempts(self.attempts)
            .page(self.page);
        patch = match next {
            ConnectionState::Connecting | ConnectionState::Connected => {
                patch.method(ConnectionMethod::Stream)
            }
            ConnectionState::Failed => patch.method(ConnectionMethod::Polling),
            ConnectionState::Idle => patch.method(ConnectionMethod::Stream),
            ConnectionState::Reconnecting => patch,
        };
        if next == ConnectionState::Connected {
            patch = patch.clear_error();
        }
        self.store.set_connection_status(patch);
    }

    fn record_error(&self, error: impl Into<String>) {
        self.store
            .set_connection_status(ConnectionStatusPatch::default().error(error));
    }

    /// Cancels timers, background tasks and the live session
    async fn halt(&mut self) {
        self.tasks.abort_all();
        self.resolve_task = None;
        self.connect_task = None;
        self.poll_task = None;

        self.page_seq += 1;
        self.conn_seq += 1;
        self.poll_seq += 1;

        self.reconnect_timer = None;
        self.poll_timer = None;

        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.subscribed.clear();
    }

    // ---- symbol resolution --------------------------------------------------

    fn page_assets(&self) -> Vec<Asset> {
        let Some(page) = self.page else {
            return Vec::new();
        };
        let universe = self.universe.borrow();
        let range = page.range(self.config.page_size, universe.len());
        universe[range].to_vec()
    }

    /// Resolves the current page, superseding any resolution in flight
    fn begin_resolve(&mut self) {
        self.page_seq += 1;
        self.resolved = false;
        if let Some(task) = self.resolve_task.take() {
            task.abort();
        }

        // in-flight polls target the previous page
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.poll_seq += 1;

        let seq = self.page_seq;
        let assets = self.page_assets();
        let mapper = self.mapper.clone();
        self.resolve_task = Some(self.tasks.spawn(async move {
            let resolution = mapper.resolve(&assets).await;
            TaskOutput::Resolved { seq, resolution }
        }));
    }

    async fn on_resolved(&mut self, resolution: SymbolResolution) {
        self.resolve_task = None;
        self.resolved = true;

        tracing::info!(
            page = ?self.page,
            mapped = resolution.mapped.len(),
            unmapped = resolution.unmapped.len(),
            coverage = resolution.coverage(),
            "Page symbols resolved"
        );

        let streamable = !resolution.mapped.is_empty();
        self.resolution.send_replace(Arc::new(resolution));

        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                if streamable {
                    self.sync_subscription().await;
                } else {
                    self.enter_polling("no streamable symbols for page".to_string())
                        .await;
                }
            }
            ConnectionState::Failed => {
                self.spawn_poll();
                if let Some(timer) = self.poll_timer.as_mut() {
                    timer.reset();
                }
            }
            ConnectionState::Idle => {}
        }
    }

    // ---- streaming ----------------------------------------------------------

    fn attempt_connect(&mut self) {
        self.conn_seq += 1;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        let seq = self.conn_seq;
        let transport = self.transport.clone();
        tracing::debug!(attempt = self.attempts + 1, "Opening stream connection");

        self.connect_task = Some(self.tasks.spawn(async move {
            let started = Instant::now();
            let result = transport.connect().await;
            TaskOutput::Connected {
                seq,
                elapsed: started.elapsed(),
                result,
            }
        }));
    }

    async fn on_connected(&mut self, result: Result<Box<dyn StreamSession>, ProviderError>) {
        self.connect_task = None;

        match result {
            Ok(session) => {
                tracing::debug!("Stream connection open");
                self.session = Some(session);
                self.subscribed.clear();
                self.sync_subscription().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempts = self.attempts, "Stream connection failed");
                self.on_stream_failure(e.to_string());
            }
        }
    }

    /// Brings the session's subscriptions in line with the resolved page
    async fn sync_subscription(&mut self) {
        if !self.resolved {
            return;
        }

        let wanted = self.resolution.borrow().symbols();
        let stale: Vec<NativeSymbol> = self
            .subscribed
            .iter()
            .filter(|s| !wanted.contains(s))
            .cloned()
            .collect();
        let fresh: Vec<NativeSymbol> = wanted
            .iter()
            .filter(|s| !self.subscribed.contains(s))
            .cloned()
            .collect();

        let unsubscribe_id = self.request_seq + 1;
        let subscribe_id = self.request_seq + 2;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        self.request_seq += 2;

        let mut result = Ok(());
        if !stale.is_empty() {
            result = session.unsubscribe(&stale, unsubscribe_id).await;
        }
        if result.is_ok() && !fresh.is_empty() {
            result = session.subscribe(&fresh, subscribe_id).await;
        }

        match result {
            Ok(()) => {
                tracing::debug!(
                    subscribed = wanted.len(),
                    added = fresh.len(),
                    removed = stale.len(),
                    "Stream subscription updated"
                );
                self.subscribed = wanted;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Subscription request failed");
                self.on_stream_failure(e.to_string());
            }
        }
    }

    async fn handle_stream_event(&mut self, event: Option<Result<StreamEvent, ProviderError>>) {
        match event {
            Some(Ok(StreamEvent::SubscriptionAck { request_id })) => {
                tracing::debug!(request_id, "Subscription acknowledged");
                self.mark_connected();
            }
            Some(Ok(StreamEvent::Ticker(update))) => self.apply_ticker(update),
            Some(Ok(StreamEvent::Malformed(raw))) => {
                tracing::warn!(payload = %raw, "Dropping malformed stream message");
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Stream error");
                self.on_stream_failure(e.to_string());
            }
            None => {
                tracing::warn!("Stream closed by remote");
                self.on_stream_failure(ProviderError::ConnectionClosed.to_string());
            }
        }
    }

    fn mark_connected(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            self.attempts = 0;
            self.transition(ConnectionState::Connected);
        }
    }

    fn apply_ticker(&mut self, update: TickerUpdate) {
        let asset_id = self.resolution.borrow().asset_for(&update.symbol).cloned();
        let Some(asset_id) = asset_id else {
            tracing::trace!(symbol = %update.symbol, "Ticker for symbol outside the active page");
            return;
        };

        self.mark_connected();
        self.store.upsert_prices(vec![PriceRecord::new(
            asset_id,
            update.price,
            update.change_24h,
            self.transport.provider_name(),
        )]);
    }

    /// Handles a dropped session or failed connect attempt
    fn on_stream_failure(&mut self, reason: String) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return;
        }

        self.session = None;
        self.subscribed.clear();
        let max = self.config.max_reconnect_attempts;
        self.attempts = (self.attempts + 1).min(max);
        self.record_error(reason.clone());

        if self.attempts >= max {
            tracing::warn!(
                attempts = self.attempts,
                max_attempts = max,
                "Reconnect attempts exhausted, falling back to polling"
            );
            self.start_polling();
            return;
        }

        let delay = self.config.backoff.delay_for(self.attempts);
        tracing::info!(
            attempt = self.attempts,
            max_attempts = max,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Scheduling reconnect"
        );
        self.transition(ConnectionState::Reconnecting);
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
    }

    // ---- polling ------------------------------------------------------------

    async fn enter_polling(&mut self, reason: String) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.subscribed.clear();
        self.record_error(reason.clone());
        tracing::warn!(reason = %reason, "Streaming unavailable, falling back to polling");
        self.start_polling();
    }

    fn start_polling(&mut self) {
        self.reconnect_timer = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.conn_seq += 1;
        self.session = None;

        self.transition(ConnectionState::Failed);

        self.poll_seq += 1;
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll_timer = Some(interval);
    }

    fn spawn_poll(&mut self) {
        if self.state != ConnectionState::Failed || !self.resolved {
            return;
        }
        if self.poll_task.is_some() {
            tracing::debug!("Previous poll still in flight, skipping tick");
            return;
        }

        let seq = self.poll_seq;
        let targets = self.resolution.borrow().poll_targets();
        let poller = self.poller.clone();
        tracing::debug!(targets = targets.len(), "Polling price snapshots");

        self.poll_task = Some(self.tasks.spawn(async move {
            let started = Instant::now();
            let result = poller.fetch_snapshots(&targets).await;
            TaskOutput::Polled {
                seq,
                elapsed: started.elapsed(),
                result,
            }
        }));
    }

    fn on_polled(&mut self, result: Result<Vec<PriceRecord>, ProviderError>) {
        self.poll_task = None;

        match result {
            Ok(records) => {
                let accepted = self.store.upsert_prices(records);
                tracing::debug!(accepted, "Applied polled snapshots");
            }
            Err(e) => {
                // existing prices stay in place, stale but present
                tracing::warn!(error = %e, transient = e.is_transient(), "Poll failed");
                self.record_error(format!("poll failed: {}", e));
            }
        }
    }

    // ---- background task results ------------------------------------------

    async fn handle_task(&mut self, joined: Result<TaskOutput, JoinError>) {
        let output = match joined {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                tracing::error!(error = %e, "Connection manager task panicked");
                return;
            }
        };

        match output {
            TaskOutput::Resolved { seq, resolution } => {
                if seq != self.page_seq {
                    tracing::debug!(seq, current = self.page_seq, "Discarding stale resolution");
                    return;
                }
                self.on_resolved(resolution).await;
            }
            TaskOutput::Connected {
                seq,
                elapsed,
                result,
            } => {
                self.metrics.connect.record(elapsed, result.is_ok()).await;
                let current = seq == self.conn_seq
                    && matches!(
                        self.state,
                        ConnectionState::Connecting | ConnectionState::Reconnecting
                    );
                if !current {
                    tracing::debug!(seq, current = self.conn_seq, "Discarding stale connection");
                    if let Ok(mut session) = result {
                        session.close().await;
                    }
                    return;
                }
                self.on_connected(result).await;
            }
            TaskOutput::Polled {
                seq,
                elapsed,
                result,
            } => {
                self.metrics.poll.record(elapsed, result.is_ok()).await;
                if seq != self.poll_seq || self.state != ConnectionState::Failed {
                    tracing::debug!(seq, current = self.poll_seq, "Discarding stale poll result");
                    return;
                }
                self.on_polled(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::provider::mock::{
        MockCatalog, MockSessionHandle, MockSnapshotProvider, MockTransport, SessionRequest,
    };
    use rust_decimal_macros::dec;
    use tokio::time::sleep;

    struct Harness {
        manager: ConnectionManager,
        store: Arc<PriceStore>,
        catalog: Arc<MockCatalog>,
        transport: Arc<MockTransport>,
        poller: Arc<MockSnapshotProvider>,
    }

    fn config() -> SyncConfig {
        SyncConfig {
            page_size: 2,
            max_reconnect_attempts: 5,
            poll_interval_secs: 30,
            backoff: BackoffPolicy {
                initial_ms: 1000,
                max_ms: 8000,
            },
            ..SyncConfig::default()
        }
    }

    fn universe() -> Vec<Asset> {
        ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|id| Asset::new(*id, *id))
            .collect()
    }

    fn harness_with(catalog: MockCatalog) -> Harness {
        let config = config();
        let store = Arc::new(PriceStore::new(config.page_size, config.max_reconnect_attempts));
        let catalog = Arc::new(catalog);
        let transport = Arc::new(MockTransport::new());
        let poller = Arc::new(MockSnapshotProvider::new());
        let mapper = Arc::new(SymbolMapper::new(catalog.clone(), "USDT"));

        let manager = ConnectionManager::spawn(
            config,
            store.clone(),
            mapper,
            transport.clone(),
            poller.clone(),
            universe(),
        );

        Harness {
            manager,
            store,
            catalog,
            transport,
            poller,
        }
    }

    fn harness() -> Harness {
        // e and f have no listing
        harness_with(MockCatalog::new(["AUSDT", "BUSDT", "CUSDT", "DUSDT"]))
    }

    async fn wait_for<F>(store: &PriceStore, condition: F) -> ConnectionStatus
    where
        F: Fn(&ConnectionStatus) -> bool,
    {
        let mut rx = store.subscribe();
        tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                let status = rx.borrow_and_update().status.clone();
                if condition(&status) {
                    return status;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("condition not reached")
    }

    async fn wait_state(store: &PriceStore, state: ConnectionState) -> ConnectionStatus {
        wait_for(store, |s| s.state == state).await
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn symbols(names: &[&str]) -> Vec<NativeSymbol> {
        names.iter().map(|n| NativeSymbol::new(n)).collect()
    }

    async fn connected(h: &Harness) -> MockSessionHandle {
        let session = h.transport.push_session();
        h.manager.start(Page(0)).await.unwrap();
        wait_state(&h.store, ConnectionState::Connected).await;
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_and_subscribes_page() {
        let h = harness();
        let session = connected(&h).await;

        let status = h.store.status();
        assert!(status.is_connected);
        assert_eq!(status.method, ConnectionMethod::Stream);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.page, Some(Page(0)));
        assert_eq!(session.subscribed(), symbols(&["AUSDT", "BUSDT"]));
        assert_eq!(h.manager.coverage(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_ticker_marks_connected_without_ack() {
        let h = harness();
        h.transport.set_manual_ack(true);
        let session = h.transport.push_session();
        h.manager.start(Page(0)).await.unwrap();
        settle().await;
        assert_eq!(h.store.status().state, ConnectionState::Connecting);

        session.send_ticker("AUSDT", dec!(100), dec!(2.5));

        wait_state(&h.store, ConnectionState::Connected).await;
        assert_eq!(h.store.get(&AssetId::new("a")).unwrap().price, dec!(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_ticker_updates_store() {
        let h = harness();
        let session = connected(&h).await;
        let before = h.store.status().update_count;

        session.send_ticker("AUSDT", dec!(100), dec!(2.5));
        let status = wait_for(&h.store, |s| s.update_count > before).await;

        let record = h.store.get(&AssetId::new("a")).unwrap();
        assert_eq!(record.price, dec!(100));
        assert_eq!(record.change_24h, dec!(2.5));
        assert_eq!(status.update_count, before + 1);
        assert!(status.last_update.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_messages_applied_in_arrival_order() {
        let h = harness();
        let session = connected(&h).await;

        session.send_ticker("AUSDT", dec!(1), dec!(0));
        session.send_ticker("BUSDT", dec!(2), dec!(0));
        session.send_ticker("AUSDT", dec!(3), dec!(0));
        wait_for(&h.store, |s| s.update_count >= 3).await;

        assert_eq!(h.store.len(), 2);
        assert_eq!(h.store.get(&AssetId::new("a")).unwrap().price, dec!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_foreign_messages_are_dropped() {
        let h = harness();
        let session = connected(&h).await;

        session.send_event(StreamEvent::Malformed("{oops".to_string()));
        session.send_ticker("ZZZUSDT", dec!(5), dec!(0));
        session.send_ticker("BUSDT", dec!(2), dec!(0));
        wait_for(&h.store, |s| s.update_count >= 1).await;

        assert_eq!(h.store.len(), 1);
        assert_eq!(h.store.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_schedules_backoff() {
        let h = harness();
        let session = connected(&h).await;
        assert_eq!(h.transport.connect_count(), 1);

        session.close();
        let status = wait_state(&h.store, ConnectionState::Reconnecting).await;
        assert_eq!(status.reconnect_attempts, 1);
        assert!(!status.is_connected);
        assert!(status.last_error.is_some());

        sleep(Duration::from_millis(900)).await;
        assert_eq!(h.transport.connect_count(), 1);

        // second attempt waits twice as long
        sleep(Duration::from_millis(200)).await;
        assert_eq!(h.transport.connect_count(), 2);
        wait_for(&h.store, |s| s.reconnect_attempts == 2).await;

        sleep(Duration::from_millis(1800)).await;
        assert_eq!(h.transport.connect_count(), 2);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(h.transport.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_error_schedules_reconnect() {
        let h = harness();
        let session = connected(&h).await;
        h.transport.push_failure();
        let next = h.transport.push_session();

        session.fail("socket reset");
        let status = wait_state(&h.store, ConnectionState::Reconnecting).await;
        assert_eq!(status.reconnect_attempts, 1);
        assert!(!status.is_connected);
        assert!(status.last_error.unwrap().contains("socket reset"));

        // the queued failure costs one more attempt before the session opens
        wait_for(&h.store, |s| s.reconnect_attempts == 2).await;
        let status = wait_state(&h.store, ConnectionState::Connected).await;
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(h.transport.connect_count(), 3);
        assert_eq!(next.subscribed(), symbols(&["AUSDT", "BUSDT"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_resets_attempts() {
        let h = harness();
        let session = connected(&h).await;
        let next = h.transport.push_session();

        session.close();
        wait_state(&h.store, ConnectionState::Reconnecting).await;
        let status = wait_state(&h.store, ConnectionState::Connected).await;

        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
        assert_eq!(next.subscribed(), symbols(&["AUSDT", "BUSDT"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fall_back_to_polling() {
        let h = harness();
        h.poller.set_price("a", dec!(10), dec!(1));
        let session = connected(&h).await;

        // first drop plus four failed reconnects
        session.close();
        let status = wait_state(&h.store, ConnectionState::Failed).await;

        assert_eq!(status.reconnect_attempts, 5);
        assert_eq!(status.method, ConnectionMethod::Polling);
        assert!(!status.is_connected);
        assert_eq!(h.transport.connect_count(), 5);

        wait_for(&h.store, |s| s.update_count >= 1).await;
        assert_eq!(h.store.get(&AssetId::new("a")).unwrap().price, dec!(10));

        // no automatic stream retries while polling
        sleep(Duration::from_secs(600)).await;
        assert_eq!(h.transport.connect_count(), 5);
        assert_eq!(h.store.status().reconnect_attempts, 5);
        assert!(h.poller.call_count() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_failures_count_as_attempts() {
        let h = harness();
        h.manager.start(Page(0)).await.unwrap();

        let status = wait_state(&h.store, ConnectionState::Failed).await;
        assert_eq!(status.reconnect_attempts, 5);
        assert_eq!(h.transport.connect_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resets_attempts_and_retries_stream() {
        let h = harness();
        h.manager.start(Page(0)).await.unwrap();
        wait_state(&h.store, ConnectionState::Failed).await;

        // keep the connect pending so the reset is observable before it lands
        h.transport.set_connect_delay(Duration::from_millis(100));
        let session = h.transport.push_session();
        h.manager.reconnect().await.unwrap();

        let status = h.store.status();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(status.reconnect_attempts, 0);

        wait_state(&h.store, ConnectionState::Connected).await;
        assert_eq!(h.store.status().method, ConnectionMethod::Stream);
        assert_eq!(session.subscribed(), symbols(&["AUSDT", "BUSDT"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_page_resubscribes() {
        let h = harness();
        let session = connected(&h).await;

        h.manager.switch_page(Page(1)).await.unwrap();
        wait_for(&h.store, |s| s.page == Some(Page(1))).await;
        settle().await;

        assert_eq!(session.subscribed(), symbols(&["CUSDT", "DUSDT"]));
        assert!(session
            .requests()
            .contains(&SessionRequest::Unsubscribe(symbols(&["AUSDT", "BUSDT"]), 3)));
        assert_eq!(h.store.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_page_keeps_attempt_counter() {
        let h = harness();
        let session = connected(&h).await;
        session.close();
        wait_state(&h.store, ConnectionState::Reconnecting).await;

        h.manager.switch_page(Page(1)).await.unwrap();
        settle().await;

        let status = h.store.status();
        assert_eq!(status.reconnect_attempts, 1);
        assert_eq!(status.page, Some(Page(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_page_switch_wins() {
        let h = harness();
        h.catalog.set_delay(Duration::from_millis(500));
        let session = h.transport.push_session();

        h.manager.start(Page(0)).await.unwrap();
        h.manager.switch_page(Page(2)).await.unwrap();
        h.manager.switch_page(Page(1)).await.unwrap();

        wait_state(&h.store, ConnectionState::Connected).await;
        settle().await;

        assert_eq!(session.subscribed(), symbols(&["CUSDT", "DUSDT"]));
        assert!(session.requests().iter().all(|r| match r {
            SessionRequest::Subscribe(s, _) => s == &symbols(&["CUSDT", "DUSDT"]),
            SessionRequest::Unsubscribe(..) => false,
        }));
        assert_eq!(h.manager.resolution().symbols(), symbols(&["CUSDT", "DUSDT"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_without_symbols_polls_by_asset_id() {
        let h = harness();
        h.poller.set_price("e", dec!(3), dec!(0));
        let _session = connected(&h).await;

        h.manager.switch_page(Page(2)).await.unwrap();
        let status = wait_state(&h.store, ConnectionState::Failed).await;
        assert_eq!(status.method, ConnectionMethod::Polling);

        wait_for(&h.store, |s| s.update_count >= 1).await;
        let targets = h.poller.last_request().unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.native.is_none()));
        assert_eq!(h.manager.unmapped(), vec![AssetId::new("e"), AssetId::new("f")]);
        assert_eq!(h.manager.coverage(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_outage_falls_back_to_polling() {
        let h = harness_with(MockCatalog::failing());
        h.poller.set_price("a", dec!(7), dec!(0));

        h.manager.start(Page(0)).await.unwrap();
        wait_state(&h.store, ConnectionState::Failed).await;
        wait_for(&h.store, |s| s.update_count >= 1).await;

        assert_eq!(h.store.get(&AssetId::new("a")).unwrap().price, dec!(7));
        assert_eq!(h.manager.unmapped().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_page_while_polling_retargets() {
        let h = harness();
        h.manager.start(Page(0)).await.unwrap();
        wait_state(&h.store, ConnectionState::Failed).await;
        settle().await;

        h.manager.switch_page(Page(1)).await.unwrap();
        settle().await;

        let targets = h.poller.last_request().unwrap();
        let ids: Vec<_> = targets.iter().map(|t| t.asset_id.to_string()).collect();
        assert_eq!(ids, vec!["c", "d"]);
        assert_eq!(h.store.status().state, ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_poll_keeps_existing_prices() {
        let h = harness();
        h.poller.set_price("a", dec!(10), dec!(0));
        h.manager.start(Page(0)).await.unwrap();
        wait_state(&h.store, ConnectionState::Failed).await;
        wait_for(&h.store, |s| s.update_count >= 1).await;

        h.poller.set_rate_limited(true);
        sleep(Duration::from_secs(31)).await;

        let status = h.store.status();
        assert_eq!(status.update_count, 1);
        assert!(status.last_error.unwrap().contains("Rate limit"));
        assert_eq!(h.store.get(&AssetId::new("a")).unwrap().price, dec!(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reconnect() {
        let h = harness();
        let session = connected(&h).await;
        session.close();
        wait_state(&h.store, ConnectionState::Reconnecting).await;

        h.manager.stop().await.unwrap();
        let version = h.store.snapshot().version;
        let connects = h.transport.connect_count();

        sleep(Duration::from_secs(120)).await;

        assert_eq!(h.store.snapshot().version, version);
        assert_eq!(h.transport.connect_count(), connects);
        assert_eq!(h.store.status().state, ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_poll() {
        let h = harness();
        h.poller.set_price("a", dec!(10), dec!(0));
        h.poller.set_delay(Duration::from_secs(5));
        h.manager.start(Page(0)).await.unwrap();
        wait_state(&h.store, ConnectionState::Failed).await;
        settle().await;
        assert_eq!(h.poller.call_count(), 1);

        h.manager.stop().await.unwrap();
        sleep(Duration::from_secs(60)).await;

        assert!(h.store.is_empty());
        assert_eq!(h.store.status().update_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_session_and_is_idempotent() {
        let h = harness();
        let session = connected(&h).await;

        h.manager.stop().await.unwrap();
        h.manager.stop().await.unwrap();

        assert!(session.is_closed());
        let status = h.store.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(!status.is_connected);
        assert_eq!(status.page, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_rejected_from_idle() {
        let h = harness();

        assert_eq!(
            h.manager.switch_page(Page(1)).await,
            Err(SyncError::InvalidTransition {
                action: Action::SwitchPage,
                state: ConnectionState::Idle,
            })
        );
        assert!(matches!(
            h.manager.reconnect().await,
            Err(SyncError::InvalidTransition { .. })
        ));
        assert_eq!(
            h.manager.start(Page(3)).await,
            Err(SyncError::PageOutOfRange { page: 3, pages: 3 })
        );
        assert_eq!(h.transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_universe_reresolves_active_page() {
        let h = harness();
        let session = connected(&h).await;

        h.manager
            .set_universe(vec![Asset::new("c", "c"), Asset::new("d", "d")])
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.manager.page_count(), 1);
        assert_eq!(session.subscribed(), symbols(&["CUSDT", "DUSDT"]));
        assert_eq!(h.store.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smaller_universe_moves_to_last_page() {
        let h = harness();
        let session = h.transport.push_session();
        h.manager.start(Page(1)).await.unwrap();
        wait_state(&h.store, ConnectionState::Connected).await;

        h.manager
            .set_universe(vec![Asset::new("a", "a"), Asset::new("b", "b")])
            .await
            .unwrap();
        settle().await;

        let status = h.store.status();
        assert_eq!(status.page, Some(Page(0)));
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(session.subscribed(), symbols(&["AUSDT", "BUSDT"]));
        assert_eq!(h.manager.resolution().symbols(), symbols(&["AUSDT", "BUSDT"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_universe_stops_stream() {
        let h = harness();
        let session = connected(&h).await;

        h.manager.set_universe(Vec::new()).await.unwrap();

        let status = h.store.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(status.page, None);
        assert!(session.is_closed());
        assert_eq!(h.manager.page_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_pages_follow_universe_rank() {
        // b has no listing
        let h = harness_with(MockCatalog::new(["AUSDT", "CUSDT", "DUSDT"]));
        let session = connected(&h).await;
        session.send_ticker("AUSDT", dec!(1), dec!(0));
        wait_for(&h.store, |s| s.update_count >= 1).await;

        h.manager.switch_page(Page(1)).await.unwrap();
        wait_for(&h.store, |s| s.page == Some(Page(1))).await;
        settle().await;
        session.send_ticker("DUSDT", dec!(4), dec!(0));
        session.send_ticker("CUSDT", dec!(3), dec!(0));
        wait_for(&h.store, |s| s.update_count >= 3).await;

        let ids = |records: Vec<PriceRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.asset_id.to_string()).collect()
        };
        assert_eq!(ids(h.store.get_by_page(Page(0))), vec!["a"]);
        assert_eq!(ids(h.store.get_by_page(Page(1))), vec!["c", "d"]);
        assert_eq!(ids(h.store.get_all()), vec!["a", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_the_task() {
        let h = harness();
        h.manager.shutdown().await.unwrap();
        assert_eq!(h.manager.start(Page(0)).await, Err(SyncError::ManagerStopped));
    }
}
