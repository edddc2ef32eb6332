//! Kraken spot connector, v2 `book` channel.
//!
//! In-band snapshot venue without sequence ids: frames are
//! timestamp-ordered and canonical updates carry zero ids. The client
//! pings actively; the server's `heartbeat` channel also counts as a
//! liveness signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::models::{DepthUpdate, HealthSnapshot, PriceLevel, Snapshot, Venue};

use super::session::{ConnectorState, TransitionReason};
use super::ws::{self, WsSource};
use super::{
    check_staleness, schedule_reconnect, Connector, ConnectorCore, VenueStream,
    HEARTBEAT_INTERVAL, SNAPSHOT_WAIT,
};

const WS_URL: &str = "wss://ws.kraken.com/v2";
const BOOK_DEPTH: u32 = 1000;

#[derive(Debug, Deserialize)]
struct ChannelFrame {
    channel: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Vec<BookData>,
}

#[derive(Debug, Deserialize)]
struct BookData {
    symbol: String,
    #[serde(default)]
    bids: Vec<Level>,
    #[serde(default)]
    asks: Vec<Level>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Kraken v2 publishes price/qty as JSON numbers.
#[derive(Debug, Deserialize)]
struct Level {
    price: Decimal,
    qty: Decimal,
}

#[derive(Debug, Deserialize)]
struct MethodFrame {
    method: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// `BTCUSDT -> BTC/USD`, `ETHEUR -> ETH/EUR`; pairs already carrying a
/// slash pass through.
fn to_kraken_symbol(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    if symbol.contains('/') {
        return symbol;
    }
    if let Some(base) = symbol.strip_suffix("USDT") {
        if !base.is_empty() {
            return format!("{base}/USD");
        }
    }
    for quote in ["USD", "EUR", "GBP"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}/{quote}");
            }
        }
    }
    warn!(symbol = %symbol, "could not map symbol to kraken pair, using as-is");
    symbol
}

pub struct KrakenConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
    ping_seq: AtomicU64,
}

impl KrakenConnector {
    pub fn new(symbol: &str) -> Arc<Self> {
        let native = to_kraken_symbol(symbol);
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(Venue::Kraken, symbol, native, 1024),
                ping_seq: AtomicU64::new(1),
            }),
        })
    }
}

#[async_trait]
impl Connector for KrakenConnector {
    fn venue(&self) -> Venue {
        Venue::Kraken
    }

    fn symbol(&self) -> &str {
        self.inner.core.native_symbol()
    }

    async fn connect(&self) -> Result<()> {
        self.inner.clone().establish().await
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        self.inner.core.await_snapshot(SNAPSHOT_WAIT).await
    }

    fn updates(&self) -> Option<mpsc::Receiver<DepthUpdate>> {
        self.inner.core.take_updates()
    }

    fn health(&self) -> HealthSnapshot {
        self.inner.core.health_snapshot()
    }

    async fn close(&self) {
        self.inner.core.begin_close();
        self.inner.core.close_transport().await;
    }
}

#[async_trait]
impl VenueStream for Inner {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    async fn establish(self: Arc<Self>) -> Result<()> {
        if self.core.is_shutdown() {
            bail!("connector closed");
        }
        self.core
            .session
            .transition(ConnectorState::Dialing, TransitionReason::Connect);

        let stream = match ws::dial(WS_URL).await {
            Ok(stream) => stream,
            Err(err) => {
                self.core.health.record_error();
                return Err(err);
            }
        };
        self.core.session.transition(
            ConnectorState::Subscribing,
            TransitionReason::TransportEstablished,
        );

        let (sink, source) = stream.split();
        self.core.store_writer(sink).await;

        let subscribe = json!({
            "method": "subscribe",
            "params": {
                "channel": "book",
                "symbol": [self.core.native_symbol()],
                "depth": BOOK_DEPTH,
                "snapshot": true,
            },
        });
        self.core
            .send_text(subscribe.to_string())
            .await
            .context("subscribe failed")?;

        self.core.health.set_connected(true);
        info!(venue = %self.core.venue(), pair = self.core.native_symbol(), "websocket connected and subscribed");
        self.core
            .session
            .transition(ConnectorState::Syncing, TransitionReason::SubscriptionSent);

        let generation = self.core.bump_generation();
        tokio::spawn(self.clone().read_loop(source, generation));
        tokio::spawn(self.clone().heartbeat_loop(generation));
        Ok(())
    }
}

impl Inner {
    async fn read_loop(self: Arc<Self>, mut source: WsSource, generation: u64) {
        let mut shutdown = self.core.shutdown_rx();
        loop {
            if self.core.is_shutdown() || self.core.generation() != generation {
                return;
            }
            let frame = tokio::select! {
                _ = shutdown.changed() => return,
                frame = source.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => self.handle_text(&text),
                Some(Ok(Message::Ping(payload))) => {
                    self.core.health.touch();
                    let _ = self.core.send_raw(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(venue = %self.core.venue(), ?frame, "server close");
                    schedule_reconnect(&self, TransitionReason::VenueDisconnect);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(venue = %self.core.venue(), error = %err, "websocket read error");
                    self.core.health.record_error();
                    schedule_reconnect(&self, TransitionReason::ReadError);
                    return;
                }
                None => {
                    schedule_reconnect(&self, TransitionReason::VenueDisconnect);
                    return;
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        if let Ok(method) = serde_json::from_str::<MethodFrame>(text) {
            match method.method.as_str() {
                "subscribe" => {
                    if method.success == Some(false) {
                        warn!(
                            venue = %self.core.venue(),
                            error = method.error.as_deref().unwrap_or(""),
                            "subscription rejected"
                        );
                        self.core.health.record_error();
                    }
                    return;
                }
                "pong" => {
                    self.core.health.touch();
                    return;
                }
                _ => return,
            }
        }

        let frame: ChannelFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        match frame.channel.as_str() {
            "heartbeat" => {
                self.core.health.touch();
                return;
            }
            "book" => {}
            _ => return,
        }
        let Some(data) = frame.data.into_iter().next() else {
            return;
        };

        self.core.health.record_message();
        let event_time = parse_event_time(data.timestamp.as_deref());
        let is_snapshot = frame.kind == "snapshot";
        let bids = to_levels(data.bids);
        let asks = to_levels(data.asks);

        if is_snapshot {
            self.core.publish_snapshot(Snapshot {
                venue: self.core.venue(),
                symbol: data.symbol.clone(),
                // Kraken sequences by timestamp, not ids.
                last_update_id: 0,
                bids: bids.clone(),
                asks: asks.clone(),
                observed_at: event_time,
            });
            self.core
                .session
                .transition(ConnectorState::Streaming, TransitionReason::SnapshotSynced);
        }

        self.core.emit(DepthUpdate {
            venue: self.core.venue(),
            symbol: data.symbol,
            event_time,
            first_update_id: 0,
            final_update_id: 0,
            prev_update_id: 0,
            bids,
            asks,
            is_snapshot,
        });
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.core.shutdown_rx();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if self.core.is_shutdown() || self.core.generation() != generation {
                return;
            }
            if check_staleness(&self) {
                return;
            }
            let req_id = self.ping_seq.fetch_add(1, Ordering::Relaxed);
            let ping = json!({ "method": "ping", "req_id": req_id });
            if let Err(err) = self.core.send_text(ping.to_string()).await {
                warn!(venue = %self.core.venue(), error = %err, "ping send failed");
            }
        }
    }
}

fn parse_event_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn to_levels(raw: Vec<Level>) -> Vec<PriceLevel> {
    raw.into_iter()
        .map(|level| PriceLevel {
            price: level.price,
            quantity: level.qty,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inner() -> Arc<Inner> {
        KrakenConnector::new("BTCUSDT").inner.clone()
    }

    #[test]
    fn symbol_translation() {
        assert_eq!(to_kraken_symbol("BTCUSDT"), "BTC/USD");
        assert_eq!(to_kraken_symbol("ETHEUR"), "ETH/EUR");
        assert_eq!(to_kraken_symbol("SOLGBP"), "SOL/GBP");
        assert_eq!(to_kraken_symbol("BTC/USD"), "BTC/USD");
    }

    #[tokio::test]
    async fn snapshot_then_update() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        inner.handle_text(
            r#"{"channel":"book","type":"snapshot","data":[{"symbol":"BTC/USD","bids":[{"price":45283.5,"qty":0.1}],"asks":[{"price":45285.2,"qty":0.2}],"checksum":2439117997}]}"#,
        );
        inner.handle_text(
            r#"{"channel":"book","type":"update","data":[{"symbol":"BTC/USD","bids":[{"price":45283.5,"qty":0.0}],"asks":[],"checksum":123,"timestamp":"2023-10-06T17:35:55.440295Z"}]}"#,
        );

        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.is_snapshot);
        assert_eq!(snapshot.final_update_id, 0);
        assert_eq!(snapshot.bids[0].price, dec!(45283.5));

        let update = rx.recv().await.unwrap();
        assert!(!update.is_snapshot);
        assert_eq!(update.bids[0].quantity, dec!(0));
    }

    #[tokio::test]
    async fn heartbeats_and_pongs_touch_liveness_only() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        inner.handle_text(r#"{"channel":"heartbeat"}"#);
        inner.handle_text(r#"{"method":"pong","req_id":1,"time_in":"a","time_out":"b"}"#);
        assert!(rx.try_recv().is_err());
        let health = inner.core.health_snapshot();
        assert_eq!(health.message_count, 0);
        assert!(health.last_message_at.is_some());
    }

    #[tokio::test]
    async fn failed_subscription_counts_error() {
        let inner = inner();
        inner.handle_text(
            r#"{"method":"subscribe","success":false,"error":"Currency pair not supported","time_in":"a","time_out":"b"}"#,
        );
        assert_eq!(inner.core.health_snapshot().error_count, 1);
    }
}
