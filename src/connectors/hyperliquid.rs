//! Hyperliquid connector, `l2Book` subscription.
//!
//! Snapshot-replace venue: every frame carries the full published book
//! for the coin, keyed by exchange timestamp. The venue neither pings
//! nor expects pings; liveness is frame arrival.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
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
    millis_to_utc, passive_heartbeat, schedule_reconnect, Connector, ConnectorCore, VenueStream,
    SNAPSHOT_WAIT,
};

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

#[derive(Debug, Deserialize)]
struct WsFrame {
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsBook {
    coin: String,
    time: i64,
    /// `levels[0]` bids, `levels[1]` asks.
    levels: Vec<Vec<BookLevel>>,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    px: Decimal,
    sz: Decimal,
}

/// `BTCUSDT -> BTC`; Hyperliquid subscribes by coin.
fn to_coin(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    symbol
}

pub struct HyperliquidConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
}

impl HyperliquidConnector {
    pub fn new(symbol: &str) -> Arc<Self> {
        let native = to_coin(symbol);
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(Venue::Hyperliquid, symbol, native, 4096),
            }),
        })
    }
}

#[async_trait]
impl Connector for HyperliquidConnector {
    fn venue(&self) -> Venue {
        Venue::Hyperliquid
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
            "subscription": { "type": "l2Book", "coin": self.core.native_symbol() },
        });
        self.core
            .send_text(subscribe.to_string())
            .await
            .context("subscribe failed")?;

        self.core.health.set_connected(true);
        info!(venue = %self.core.venue(), coin = self.core.native_symbol(), "websocket connected and subscribed");
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
            Err(_) => return,
        };
        match frame.channel.as_str() {
            "subscriptionResponse" => return,
            "error" => {
                warn!(venue = %self.core.venue(), data = %frame.data, "venue error");
                self.core.health.record_error();
                return;
            }
            "l2Book" => {}
            _ => return,
        }

        let book: WsBook = match serde_json::from_value(frame.data) {
            Ok(book) => book,
            Err(err) => {
                debug!(venue = %self.core.venue(), error = %err, "undecodable book frame");
                return;
            }
        };
        self.core.health.record_message();

        let event_time = millis_to_utc(book.time);
        let time_id = book.time.max(0) as u64;
        let mut sides = book.levels.into_iter();
        let bids = to_levels(sides.next().unwrap_or_default());
        let asks = to_levels(sides.next().unwrap_or_default());

        let first_frame = self.core.session.state() != ConnectorState::Streaming;
        if first_frame {
            self.core.publish_snapshot(Snapshot {
                venue: self.core.venue(),
                symbol: book.coin.clone(),
                last_update_id: time_id,
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
            symbol: book.coin,
            event_time,
            first_update_id: time_id,
            final_update_id: time_id,
            prev_update_id: 0,
            bids,
            asks,
            is_snapshot: true,
        });
    }
}

fn to_levels(raw: Vec<BookLevel>) -> Vec<PriceLevel> {
    raw.into_iter()
        .map(|level| PriceLevel {
            price: level.px,
            quantity: level.sz,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inner() -> Arc<Inner> {
        HyperliquidConnector::new("BTCUSDT").inner.clone()
    }

    #[test]
    fn symbol_translation() {
        assert_eq!(to_coin("BTCUSDT"), "BTC");
        assert_eq!(to_coin("ethusd"), "ETH");
        assert_eq!(to_coin("SOL"), "SOL");
    }

    #[tokio::test]
    async fn l2_book_frames_replace() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        let text = r#"{"channel":"l2Book","data":{"coin":"BTC","time":1700000000000,"levels":[[{"px":"19900","sz":"1","n":2},{"px":"19890","sz":"3","n":1}],[{"px":"20100","sz":"1","n":2}]]}}"#;
        inner.handle_text(text);

        let update = rx.recv().await.unwrap();
        assert!(update.is_snapshot);
        assert_eq!(update.symbol, "BTC");
        assert_eq!(update.final_update_id, 1700000000000);
        assert_eq!(update.bids.len(), 2);
        assert_eq!(update.bids[0].price, dec!(19900));
        assert_eq!(update.asks[0].quantity, dec!(1));

        let snapshot = inner
            .core
            .await_snapshot(std::time::Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(snapshot.last_update_id, 1700000000000);
    }

    #[tokio::test]
    async fn subscription_response_is_ignored() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        inner.handle_text(
            r#"{"channel":"subscriptionResponse","data":{"method":"subscribe","subscription":{"type":"l2Book","coin":"BTC"}}}"#,
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(inner.core.health_snapshot().message_count, 0);
    }
}
