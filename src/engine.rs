//! Multi-venue coordinator.
//!
//! Owns one connector and one book per venue, drains each connector's
//! canonical update stream into its book, and rebuilds the whole set on
//! symbol change. The broadcast server reads books only through
//! [`Engine::sample`], which copies views out under each book's lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::book::OrderBook;
use crate::connectors::{self, Connector};
use crate::models::{Config, DepthView, HealthSnapshot, StatsRecord, Venue};

/// Pause between tearing down the old connector set and dialing the new
/// one, letting the transport layer settle.
const SYMBOL_CHANGE_SETTLE: Duration = Duration::from_millis(500);

/// Bound on waiting for a connector's close and its ingest drain.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Initial-connect retry law, matching the connector-internal backoff.
const CONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const CONNECT_MAX_ATTEMPTS: u32 = 10;

const SNAPSHOT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub enum EngineCommand {
    ChangeSymbol(String),
}

/// One venue's point-in-time view for a broadcast tick.
#[derive(Debug, Clone)]
pub struct VenueSample {
    pub venue: Venue,
    pub view: DepthView,
    pub stats: Option<StatsRecord>,
}

struct Shared {
    venues: Vec<Venue>,
    symbol: RwLock<String>,
    books: RwLock<HashMap<Venue, Arc<Mutex<OrderBook>>>>,
    connectors: RwLock<HashMap<Venue, Arc<dyn Connector>>>,
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<EngineCommand>,
}

struct VenueTask {
    connector: Arc<dyn Connector>,
    ingest: JoinHandle<()>,
}

impl Engine {
    pub(crate) fn new(config: &Config) -> (Self, mpsc::Receiver<EngineCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let engine = Self {
            shared: Arc::new(Shared {
                venues: config.venues.clone(),
                symbol: RwLock::new(config.symbol.clone()),
                books: RwLock::new(HashMap::new()),
                connectors: RwLock::new(HashMap::new()),
            }),
            cmd_tx,
        };
        (engine, cmd_rx)
    }

    /// Builds the engine and spawns its supervisor.
    pub fn start(config: &Config, shutdown: watch::Receiver<bool>) -> Self {
        let (engine, cmd_rx) = Self::new(config);
        let shared = engine.shared.clone();
        tokio::spawn(supervise(shared, cmd_rx, shutdown));
        engine
    }

    pub fn current_symbol(&self) -> String {
        self.shared.symbol.read().clone()
    }

    /// Forwards a symbol change request. Invalid symbols are dropped with
    /// a log line; the requesting client is not disconnected.
    pub fn change_symbol(&self, symbol: &str) {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            warn!(%symbol, "ignoring malformed symbol change request");
            return;
        }
        if symbol == self.current_symbol() {
            return;
        }
        if self
            .cmd_tx
            .try_send(EngineCommand::ChangeSymbol(symbol.clone()))
            .is_err()
        {
            warn!(%symbol, "engine command queue full, dropping symbol change");
        }
    }

    /// Point-in-time views of every venue book. Each book's lock is held
    /// only to extract its view; serialization happens at the caller.
    pub fn sample(&self, tick: Decimal, depth: usize) -> Vec<VenueSample> {
        let books = self.shared.books.read();
        let mut venues: Vec<Venue> = books.keys().copied().collect();
        venues.sort();

        let mut samples = Vec::with_capacity(venues.len());
        for venue in venues {
            let book = &books[&venue];
            let guard = book.lock();
            let view = guard.aggregate_by_tick(tick, depth);
            let stats = guard.stats();
            drop(guard);
            samples.push(VenueSample { venue, view, stats });
        }
        samples
    }

    /// Lock-free health snapshots for every live connector.
    pub fn health(&self) -> Vec<(Venue, HealthSnapshot)> {
        let connectors = self.shared.connectors.read();
        let mut entries: Vec<(Venue, HealthSnapshot)> = connectors
            .iter()
            .map(|(venue, connector)| (*venue, connector.health()))
            .collect();
        entries.sort_by_key(|(venue, _)| *venue);
        entries
    }

    #[cfg(test)]
    pub(crate) fn insert_book_for_test(&self, book: OrderBook) {
        self.shared
            .books
            .write()
            .insert(book.venue(), Arc::new(Mutex::new(book)));
    }
}

async fn supervise(
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut fleet = launch_fleet(&shared).await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(EngineCommand::ChangeSymbol(symbol)) => {
                    info!(%symbol, "symbol change: rebuilding connector set");
                    teardown_fleet(&shared, std::mem::take(&mut fleet)).await;
                    *shared.symbol.write() = symbol;
                    tokio::time::sleep(SYMBOL_CHANGE_SETTLE).await;
                    fleet = launch_fleet(&shared).await;
                }
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("engine shutting down");
    teardown_fleet(&shared, fleet).await;
}

async fn launch_fleet(shared: &Arc<Shared>) -> Vec<VenueTask> {
    let symbol = shared.symbol.read().clone();
    let mut fleet = Vec::with_capacity(shared.venues.len());

    for &venue in &shared.venues {
        let connector = connectors::build(venue, &symbol);
        let book = Arc::new(Mutex::new(OrderBook::new(venue, symbol.clone())));

        shared.books.write().insert(venue, book.clone());
        shared.connectors.write().insert(venue, connector.clone());

        let ingest = tokio::spawn(ingest_task(venue, connector.clone(), book));
        fleet.push(VenueTask { connector, ingest });
    }
    fleet
}

async fn teardown_fleet(shared: &Arc<Shared>, fleet: Vec<VenueTask>) {
    for task in &fleet {
        let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, task.connector.close()).await;
    }
    for task in fleet {
        let venue = task.connector.venue();
        if tokio::time::timeout(TEARDOWN_TIMEOUT, task.ingest)
            .await
            .is_err()
        {
            warn!(%venue, "ingest task did not drain in time");
        }
    }
    shared.books.write().clear();
    shared.connectors.write().clear();
}

/// Per-venue ingest: connect (with retry), load the first snapshot, then
/// drain the canonical stream into the book until the connector closes.
async fn ingest_task(venue: Venue, connector: Arc<dyn Connector>, book: Arc<Mutex<OrderBook>>) {
    let Some(mut updates) = connector.updates() else {
        warn!(%venue, "update stream already taken");
        return;
    };

    let mut attempt: u32 = 0;
    loop {
        match connector.connect().await {
            Ok(()) => break,
            Err(err) => {
                attempt += 1;
                if attempt >= CONNECT_MAX_ATTEMPTS {
                    warn!(%venue, error = %err, "venue failed to come up, leaving it offline");
                    return;
                }
                let delay = (CONNECT_BASE_DELAY * attempt).min(CONNECT_MAX_DELAY);
                warn!(
                    %venue,
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    // The stream will also deliver the snapshot as a replace-update, so a
    // missed fetch here only delays the first view.
    for attempt in 1..=SNAPSHOT_ATTEMPTS {
        match connector.fetch_snapshot().await {
            Ok(snapshot) => {
                book.lock().load_snapshot(&snapshot);
                info!(
                    %venue,
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    last_update_id = snapshot.last_update_id,
                    "initial snapshot loaded"
                );
                break;
            }
            Err(err) => {
                warn!(%venue, error = %err, attempt, "snapshot fetch failed");
            }
        }
    }

    while let Some(update) = updates.recv().await {
        book.lock().apply(&update);
    }
    info!(%venue, "ingest drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::test_support::snapshot;
    use rust_decimal_macros::dec;

    fn config() -> Config {
        Config {
            symbol: "BTCUSDT".to_string(),
            port: 8080,
            venues: vec![Venue::Binance, Venue::Kraken],
        }
    }

    fn engine_with_books() -> (Engine, mpsc::Receiver<EngineCommand>) {
        let (engine, cmd_rx) = Engine::new(&config());
        let mut binance = OrderBook::new(Venue::Binance, "BTCUSDT");
        binance.load_snapshot(&snapshot(
            1,
            &[("100", "2"), ("99", "1")],
            &[("101", "3"), ("102", "1")],
        ));
        engine.insert_book_for_test(binance);
        let mut kraken = OrderBook::new(Venue::Kraken, "BTC/USD");
        kraken.load_snapshot(&snapshot(0, &[("100.5", "1")], &[("100.9", "4")]));
        engine.insert_book_for_test(kraken);
        (engine, cmd_rx)
    }

    #[tokio::test]
    async fn sample_returns_views_in_venue_order() {
        let (engine, _cmd_rx) = engine_with_books();
        let samples = engine.sample(Decimal::ZERO, 20);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].venue, Venue::Binance);
        assert_eq!(samples[1].venue, Venue::Kraken);

        let binance = &samples[0];
        assert_eq!(binance.view.bids[0].price, dec!(100));
        let stats = binance.stats.as_ref().unwrap();
        assert_eq!(stats.mid_price, dec!(100.5));
        assert_eq!(stats.spread, dec!(1));
    }

    #[tokio::test]
    async fn sample_applies_tick_aggregation() {
        let (engine, _cmd_rx) = engine_with_books();
        let samples = engine.sample(dec!(1), 20);
        let kraken = samples
            .iter()
            .find(|sample| sample.venue == Venue::Kraken)
            .unwrap();
        // 100.5 floors to 100, 100.9 ceils to 101.
        assert_eq!(kraken.view.bids[0].price, dec!(100));
        assert_eq!(kraken.view.asks[0].price, dec!(101));
    }

    #[tokio::test]
    async fn change_symbol_validates_and_forwards() {
        let (engine, mut cmd_rx) = engine_with_books();

        engine.change_symbol("not a symbol!");
        engine.change_symbol("");
        engine.change_symbol("BTCUSDT"); // unchanged, dropped
        assert!(cmd_rx.try_recv().is_err());

        engine.change_symbol("ethusdt");
        match cmd_rx.try_recv().unwrap() {
            EngineCommand::ChangeSymbol(symbol) => assert_eq!(symbol, "ETHUSDT"),
        }
    }
}
