//! Coinbase connector, Advanced Trade `level2` channel.
//!
//! In-band snapshot venue with side-tagged updates: every event carries a
//! list of `{side, price_level, new_quantity}` entries instead of split
//! bid/ask arrays. The `heartbeats` channel is subscribed alongside as
//! the liveness signal.

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
    passive_heartbeat, schedule_reconnect, Connector, ConnectorCore, VenueStream, SNAPSHOT_WAIT,
};

const WS_URL: &str = "wss://advanced-trade-ws.coinbase.com";

#[derive(Debug, Deserialize)]
struct WsFrame {
    channel: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    product_id: String,
    #[serde(default)]
    updates: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    side: String,
    #[serde(default)]
    event_time: Option<String>,
    price_level: Decimal,
    new_quantity: Decimal,
}

/// `BTCUSDT -> BTC-USD`; product-id-style input passes through.
fn to_product_id(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    if symbol.contains('-') {
        return symbol;
    }
    if let Some(base) = symbol.strip_suffix("USDT") {
        if !base.is_empty() {
            return format!("{base}-USD");
        }
    }
    for quote in ["USD", "EUR", "GBP"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}-{quote}");
            }
        }
    }
    symbol
}

pub struct CoinbaseConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
}

impl CoinbaseConnector {
    pub fn new(symbol: &str) -> Arc<Self> {
        let native = to_product_id(symbol);
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(Venue::Coinbase, symbol, native, 1024),
            }),
        })
    }
}

#[async_trait]
impl Connector for CoinbaseConnector {
    fn venue(&self) -> Venue {
        Venue::Coinbase
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

        // One channel per subscribe message on this endpoint.
        for channel in ["level2", "heartbeats"] {
            let subscribe = json!({
                "type": "subscribe",
                "product_ids": [self.core.native_symbol()],
                "channel": channel,
            });
            self.core
                .send_text(subscribe.to_string())
                .await
                .with_context(|| format!("subscribe to {channel} failed"))?;
        }

        self.core.health.set_connected(true);
        info!(venue = %self.core.venue(), product = self.core.native_symbol(), "websocket connected and subscribed");
        self.core
            .session
            .transition(ConnectorState::Syncing, TransitionReason::SubscriptionSent);

        let generation = self.core.bump_generation();
        tokio::spawn(self.clone().read_loop(source, generation));
        tokio::spawn(passive_heartbeat(self.clone(), generation));
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
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(venue = %self.core.venue(), error = %err, "undecodable frame");
                return;
            }
        };
        match frame.channel.as_str() {
            "heartbeats" => {
                self.core.health.touch();
                return;
            }
            "subscriptions" => return,
            "l2_data" => {}
            _ => return,
        }

        let frame_time = parse_rfc3339(frame.timestamp.as_deref());
        for event in frame.events {
            if event.product_id.is_empty() {
                continue;
            }
            self.core.health.record_message();

            let is_snapshot = event.kind == "snapshot";
            let mut bids = Vec::new();
            let mut asks = Vec::new();
            let mut event_time = frame_time;
            for update in event.updates {
                if let Some(ts) = parse_rfc3339_opt(update.event_time.as_deref()) {
                    event_time = ts;
                }
                let level = PriceLevel {
                    price: update.price_level,
                    quantity: update.new_quantity,
                };
                match update.side.as_str() {
                    "bid" => bids.push(level),
                    // The venue labels the sell side "offer".
                    "offer" | "ask" => asks.push(level),
                    other => {
                        debug!(venue = %self.core.venue(), side = other, "unknown side, dropping level");
                    }
                }
            }

            if is_snapshot {
                self.core.publish_snapshot(Snapshot {
                    venue: self.core.venue(),
                    symbol: event.product_id.clone(),
                    // Level2 exposes no monotonic book id.
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
                symbol: event.product_id,
                event_time,
                first_update_id: 0,
                final_update_id: 0,
                prev_update_id: 0,
                bids,
                asks,
                is_snapshot,
            });
        }
    }
}

fn parse_rfc3339(raw: Option<&str>) -> DateTime<Utc> {
    parse_rfc3339_opt(raw).unwrap_or_else(Utc::now)
}

fn parse_rfc3339_opt(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inner() -> Arc<Inner> {
        CoinbaseConnector::new("BTCUSDT").inner.clone()
    }

    #[test]
    fn symbol_translation() {
        assert_eq!(to_product_id("BTCUSDT"), "BTC-USD");
        assert_eq!(to_product_id("ethusd"), "ETH-USD");
        assert_eq!(to_product_id("BTC-USD"), "BTC-USD");
    }

    #[tokio::test]
    async fn snapshot_event_splits_sides() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        inner.handle_text(
            r#"{"channel":"l2_data","client_id":"","timestamp":"2023-02-09T20:32:50.714964855Z","sequence_num":0,"events":[{"type":"snapshot","product_id":"BTC-USD","updates":[{"side":"bid","event_time":"2023-02-09T20:32:50.714964855Z","price_level":"21921.73","new_quantity":"0.06317902"},{"side":"offer","event_time":"2023-02-09T20:32:50.714964855Z","price_level":"21921.74","new_quantity":"0.02"}]}]}"#,
        );

        let update = rx.recv().await.unwrap();
        assert!(update.is_snapshot);
        assert_eq!(update.bids.len(), 1);
        assert_eq!(update.asks.len(), 1);
        assert_eq!(update.bids[0].price, dec!(21921.73));
        assert_eq!(update.asks[0].quantity, dec!(0.02));
        assert_eq!(update.final_update_id, 0);

        let snapshot = inner
            .core
            .await_snapshot(std::time::Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(snapshot.symbol, "BTC-USD");
    }

    #[tokio::test]
    async fn update_event_with_zero_quantity() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        inner.handle_text(
            r#"{"channel":"l2_data","timestamp":"2023-02-09T20:32:50.714964855Z","sequence_num":1,"events":[{"type":"update","product_id":"BTC-USD","updates":[{"side":"bid","event_time":"2023-02-09T20:32:51.0Z","price_level":"21921.73","new_quantity":"0"}]}]}"#,
        );
        let update = rx.recv().await.unwrap();
        assert!(!update.is_snapshot);
        assert_eq!(update.bids[0].quantity, dec!(0));
    }

    #[tokio::test]
    async fn heartbeats_touch_without_counting() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        inner.handle_text(
            r#"{"channel":"heartbeats","client_id":"","timestamp":"2023-06-23T20:31:26.122969572Z","sequence_num":0,"events":[{"current_time":"2023-06-23 20:31:56.121961769 +0000 UTC m=+91717.525857105","heartbeat_counter":"3049"}]}"#,
        );
        assert!(rx.try_recv().is_err());
        let health = inner.core.health_snapshot();
        assert_eq!(health.message_count, 0);
        assert!(health.last_message_at.is_some());
    }
}
