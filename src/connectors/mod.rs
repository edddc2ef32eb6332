//! Venue connectors.
//!
//! Each venue adapter translates its exchange's stream into canonical
//! `DepthUpdate`s behind the common [`Connector`] contract. Protocol quirks
//! never leave the connector; the engine only ever sees canonical updates.

pub mod binance;
pub mod bitstamp;
pub mod bybit;
pub mod coinbase;
pub mod gate;
pub mod health;
pub mod hyperliquid;
pub mod kraken;
pub mod okx;
pub mod session;
pub mod sync;
mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::models::{DepthUpdate, HealthSnapshot, PriceLevel, Snapshot, Venue};
use health::HealthTracker;
use session::{ConnectorState, Session, TransitionReason};

/// Heartbeat probe cadence shared by every connector.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// No liveness signal for this long forces a reconnect.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(60);

/// Converts a venue millisecond timestamp, falling back to now for
/// out-of-range values.
pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Maps venue `[price, quantity]` pairs into canonical levels.
pub(crate) fn pairs_to_levels(pairs: Vec<(Decimal, Decimal)>) -> Vec<PriceLevel> {
    pairs
        .into_iter()
        .map(|(price, quantity)| PriceLevel { price, quantity })
        .collect()
}

/// How long `fetch_snapshot` waits for the connector to produce its first
/// aligned snapshot.
pub const SNAPSHOT_WAIT: Duration = Duration::from_secs(10);

/// Abstract venue adapter. One instance serves one `(venue, symbol)`
/// lifetime; after `close` a fresh instance must be built.
#[async_trait]
pub trait Connector: Send + Sync {
    fn venue(&self) -> Venue;

    /// Venue-native symbol this connector subscribed with.
    fn symbol(&self) -> &str;

    /// Establishes the transport and starts the read/heartbeat loops.
    /// Returns once subscription frames are sent; snapshot alignment may
    /// still be in flight.
    async fn connect(&self) -> Result<()>;

    /// Waits for the first aligned snapshot of this connection.
    async fn fetch_snapshot(&self) -> Result<Snapshot>;

    /// Takes the canonical update stream. Yields `None` on second call;
    /// the stream is created once per connector and survives reconnects.
    fn updates(&self) -> Option<mpsc::Receiver<DepthUpdate>>;

    fn health(&self) -> HealthSnapshot;

    /// Idempotent teardown: stops all loops, terminates the update
    /// stream, and sends a transport close within a bounded window.
    async fn close(&self);
}

/// Builds the connector for a venue, given the canonical symbol.
pub fn build(venue: Venue, symbol: &str) -> Arc<dyn Connector> {
    match venue {
        Venue::Binance => binance::BinanceConnector::new(binance::Market::Spot, symbol),
        Venue::BinanceFutures => {
            binance::BinanceConnector::new(binance::Market::UsdFutures, symbol)
        }
        Venue::Bybit => bybit::BybitConnector::new(symbol),
        Venue::Okx => okx::OkxConnector::new(symbol),
        Venue::Kraken => kraken::KrakenConnector::new(symbol),
        Venue::Coinbase => coinbase::CoinbaseConnector::new(symbol),
        Venue::Gate => gate::GateConnector::new(symbol),
        Venue::Bitstamp => bitstamp::BitstampConnector::new(symbol),
        Venue::Hyperliquid => hyperliquid::HyperliquidConnector::new(symbol),
    }
}

/// State shared by every connector implementation: the one-per-lifetime
/// update channel, the snapshot slot, the write half of the socket,
/// health counters, the lifecycle session, and the shutdown signal.
pub(crate) struct ConnectorCore {
    venue: Venue,
    native_symbol: String,
    canonical_symbol: String,
    update_tx: Mutex<Option<mpsc::Sender<DepthUpdate>>>,
    update_rx: Mutex<Option<mpsc::Receiver<DepthUpdate>>>,
    snapshot_tx: watch::Sender<Option<Snapshot>>,
    shutdown_tx: watch::Sender<bool>,
    // Serializes heartbeat and subscription writers on one socket.
    writer: tokio::sync::Mutex<Option<ws::WsSink>>,
    generation: AtomicU64,
    dropped_updates: AtomicU64,
    pub health: HealthTracker,
    pub session: Session,
}

impl ConnectorCore {
    pub fn new(venue: Venue, canonical_symbol: &str, native_symbol: String, capacity: usize) -> Self {
        let (update_tx, update_rx) = mpsc::channel(capacity);
        let (snapshot_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            venue,
            native_symbol,
            canonical_symbol: canonical_symbol.to_string(),
            update_tx: Mutex::new(Some(update_tx)),
            update_rx: Mutex::new(Some(update_rx)),
            snapshot_tx,
            shutdown_tx,
            writer: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            dropped_updates: AtomicU64::new(0),
            health: HealthTracker::new(),
            session: Session::new(venue),
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn native_symbol(&self) -> &str {
        &self.native_symbol
    }

    /// Sends a canonical update without blocking the read loop. A full
    /// channel drops the update rather than stalling the venue stream.
    pub fn emit(&self, update: DepthUpdate) {
        let guard = self.update_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_updates.fetch_add(1, Ordering::Relaxed);
                warn!(venue = %self.venue, "update channel full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    /// Publishes the latest aligned snapshot for `fetch_snapshot` waiters.
    pub fn publish_snapshot(&self, snapshot: Snapshot) {
        self.snapshot_tx.send_replace(Some(snapshot));
    }

    pub async fn await_snapshot(&self, wait: Duration) -> Result<Snapshot> {
        let mut rx = self.snapshot_tx.subscribe();
        let venue = self.venue;
        tokio::time::timeout(wait, async move {
            loop {
                if let Some(snapshot) = rx.borrow_and_update().clone() {
                    return Ok(snapshot);
                }
                if rx.changed().await.is_err() {
                    bail!("connector closed before first snapshot");
                }
            }
        })
        .await
        .with_context(|| format!("[{venue}] timed out waiting for snapshot"))?
    }

    pub fn take_updates(&self) -> Option<mpsc::Receiver<DepthUpdate>> {
        self.update_rx.lock().take()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Marks a new connection attempt; loops from older connections
    /// observe the bump and exit.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stops every loop and terminates the update stream. Dropping the
    /// sole sender is what ends the receiver side; reconnects never touch
    /// it, only close does.
    pub fn begin_close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.session
            .transition(ConnectorState::Closed, TransitionReason::CloseRequested);
        self.update_tx.lock().take();
        self.health.set_connected(false);
        tracing::debug!(
            venue = %self.venue,
            symbol = %self.canonical_symbol,
            "connector closed"
        );
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Installs the write half of a freshly dialed socket.
    pub async fn store_writer(&self, sink: ws::WsSink) {
        *self.writer.lock().await = Some(sink);
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        self.send_raw(tokio_tungstenite::tungstenite::Message::Text(text)).await
    }

    pub async fn send_raw(&self, message: tokio_tungstenite::tungstenite::Message) -> Result<()> {
        use futures_util::SinkExt;
        let mut guard = self.writer.lock().await;
        let Some(sink) = guard.as_mut() else {
            bail!("no active connection");
        };
        sink.send(message).await.context("websocket write failed")
    }

    /// Sends a transport close within a bounded window and drops the
    /// write half.
    pub async fn close_transport(&self) {
        use futures_util::SinkExt;
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            let mut guard = self.writer.lock().await;
            if let Some(sink) = guard.as_mut() {
                let _ = sink
                    .send(tokio_tungstenite::tungstenite::Message::Close(None))
                    .await;
            }
            guard.take();
        })
        .await;
    }
}

/// The per-venue stream half of a connector: how to (re)establish one
/// connection. Everything else about reconnection is shared.
#[async_trait]
pub(crate) trait VenueStream: Send + Sync + 'static {
    fn core(&self) -> &ConnectorCore;
    async fn establish(self: Arc<Self>) -> Result<()>;
}

/// Enters the reconnect chain at most once at a time: a read error and a
/// heartbeat timeout racing here yield a single chain. Backoff follows
/// the session policy; the chain aborts on shutdown or attempt
/// exhaustion (the venue then stays absent for this lifetime).
pub(crate) fn schedule_reconnect<S: VenueStream>(inner: &Arc<S>, reason: TransitionReason) {
    let core = inner.core();
    if core.is_shutdown() {
        return;
    }
    if !core.session.try_begin_reconnect() {
        tracing::debug!(venue = %core.venue(), "reconnect already in flight");
        return;
    }
    core.health.set_connected(false);
    core.health.record_reconnect();
    core.session
        .transition(ConnectorState::Reconnecting, reason);

    let inner = inner.clone();
    tokio::spawn(async move {
        let mut shutdown = inner.core().shutdown_rx();
        loop {
            if inner.core().is_shutdown() {
                break;
            }
            let Some(delay) = inner.core().session.next_backoff() else {
                warn!(venue = %inner.core().venue(), "giving up after max reconnect attempts");
                break;
            };
            tracing::info!(
                venue = %inner.core().venue(),
                attempt = inner.core().session.attempts(),
                delay_ms = delay.as_millis() as u64,
                "reconnect backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            if inner.core().is_shutdown() {
                break;
            }
            inner
                .core()
                .session
                .transition(ConnectorState::Dialing, TransitionReason::Backoff);
            match inner.clone().establish().await {
                Ok(()) => break,
                Err(err) => {
                    warn!(venue = %inner.core().venue(), error = %err, "reconnect attempt failed");
                }
            }
        }
        inner.core().session.end_reconnect();
    });
}

/// Returns true (and schedules a reconnect) when no liveness signal fell
/// inside the window.
pub(crate) fn check_staleness<S: VenueStream>(inner: &Arc<S>) -> bool {
    let Some(idle) = inner.core().health.idle() else {
        return false;
    };
    if idle <= LIVENESS_WINDOW {
        return false;
    }
    warn!(
        venue = %inner.core().venue(),
        idle_secs = idle.as_secs(),
        "stale connection"
    );
    schedule_reconnect(inner, TransitionReason::StaleConnection);
    true
}

/// Heartbeat for venues whose liveness signal is any received frame.
pub(crate) async fn passive_heartbeat<S: VenueStream>(inner: Arc<S>, generation: u64) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = inner.core().shutdown_rx();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        if inner.core().is_shutdown() || inner.core().generation() != generation {
            return;
        }
        if check_staleness(&inner) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::test_support::delta;

    fn core() -> ConnectorCore {
        ConnectorCore::new(Venue::Binance, "BTCUSDT", "BTCUSDT".to_string(), 2)
    }

    #[tokio::test]
    async fn update_stream_is_take_once() {
        let core = core();
        assert!(core.take_updates().is_some());
        assert!(core.take_updates().is_none());
    }

    #[tokio::test]
    async fn emit_drops_on_full_channel() {
        let core = core();
        let mut rx = core.take_updates().unwrap();
        for _ in 0..3 {
            core.emit(delta(1, 1, 0, &[], &[]));
        }
        assert_eq!(core.dropped_updates(), 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_terminates_update_stream() {
        let core = core();
        let mut rx = core.take_updates().unwrap();
        core.emit(delta(1, 1, 0, &[], &[]));
        core.begin_close();
        core.emit(delta(2, 2, 1, &[], &[]));
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert!(core.is_shutdown());
    }

    #[tokio::test]
    async fn snapshot_slot_wakes_waiters() {
        let core = Arc::new(core());
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.await_snapshot(Duration::from_secs(1)).await })
        };
        core.publish_snapshot(crate::book::test_support::snapshot(7, &[("1", "1")], &[]));
        let snapshot = waiter.await.unwrap().unwrap();
        assert_eq!(snapshot.last_update_id, 7);
    }
}
