//! Bitstamp connector, live `order_book` channel.
//!
//! Snapshot-replace venue: every frame carries the top 100 of the book,
//! so each one is emitted with the replace flag. Depth-limited; wider
//! statistics bands saturate at what the venue publishes.

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

use crate::models::{DepthUpdate, HealthSnapshot, Snapshot, Venue};

use super::session::{ConnectorState, TransitionReason};
use super::ws::{self, WsSource};
use super::{
    millis_to_utc, pairs_to_levels, passive_heartbeat, schedule_reconnect, Connector,
    ConnectorCore, VenueStream, SNAPSHOT_WAIT,
};

const WS_URL: &str = "wss://ws.bitstamp.net";

#[derive(Debug, Deserialize)]
struct WsFrame {
    event: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BookData {
    microtimestamp: String,
    #[serde(default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    asks: Vec<(Decimal, Decimal)>,
}

/// `BTCUSDT -> btcusd`; Bitstamp pairs are lowercase without separator.
fn to_bitstamp_pair(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    if let Some(base) = symbol.strip_suffix("USDT") {
        if !base.is_empty() {
            return format!("{}usd", base.to_lowercase());
        }
    }
    symbol.to_lowercase()
}

pub struct BitstampConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
}

impl BitstampConnector {
    pub fn new(symbol: &str) -> Arc<Self> {
        let native = to_bitstamp_pair(symbol);
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(Venue::Bitstamp, symbol, native, 1024),
            }),
        })
    }
}

#[async_trait]
impl Connector for BitstampConnector {
    fn venue(&self) -> Venue {
        Venue::Bitstamp
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
            "event": "bts:subscribe",
            "data": { "channel": format!("order_book_{}", self.core.native_symbol()) },
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
                Some(Ok(Message::Text(text))) => {
                    if let Some(reason) = self.handle_text(&text) {
                        schedule_reconnect(&self, reason);
                        return;
                    }
                }
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

    fn handle_text(&self, text: &str) -> Option<TransitionReason> {
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => return None,
        };
        match frame.event.as_str() {
            "bts:subscription_succeeded" => return None,
            // The venue asks clients to cycle the connection.
            "bts:request_reconnect" => {
                info!(venue = %self.core.venue(), "venue requested reconnect");
                return Some(TransitionReason::VenueDisconnect);
            }
            "bts:error" => {
                warn!(venue = %self.core.venue(), data = %frame.data, "venue error");
                self.core.health.record_error();
                return None;
            }
            "data" => {}
            _ => return None,
        }
        if !frame.channel.starts_with("order_book_") {
            return None;
        }

        let data: BookData = match serde_json::from_value(frame.data) {
            Ok(data) => data,
            Err(err) => {
                debug!(venue = %self.core.venue(), error = %err, "undecodable book frame");
                return None;
            }
        };
        self.core.health.record_message();

        let micros: u64 = data.microtimestamp.parse().unwrap_or(0);
        let event_time = millis_to_utc((micros / 1_000) as i64);
        let bids = pairs_to_levels(data.bids);
        let asks = pairs_to_levels(data.asks);

        let first_frame = self.core.session.state() != ConnectorState::Streaming;
        if first_frame {
            self.core.publish_snapshot(Snapshot {
                venue: self.core.venue(),
                symbol: self.core.native_symbol().to_string(),
                last_update_id: micros,
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
            symbol: self.core.native_symbol().to_string(),
            event_time,
            first_update_id: micros,
            final_update_id: micros,
            prev_update_id: 0,
            bids,
            asks,
            is_snapshot: true,
        });
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inner() -> Arc<Inner> {
        BitstampConnector::new("BTCUSDT").inner.clone()
    }

    #[test]
    fn symbol_translation() {
        assert_eq!(to_bitstamp_pair("BTCUSDT"), "btcusd");
        assert_eq!(to_bitstamp_pair("ETHUSD"), "ethusd");
    }

    #[tokio::test]
    async fn every_frame_is_a_replace() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        let text = r#"{"event":"data","channel":"order_book_btcusd","data":{"timestamp":"1588086810","microtimestamp":"1588086810556025","bids":[["8732.06","0.00064858"]],"asks":[["8735.07","4.93690727"]]}}"#;
        assert!(inner.handle_text(text).is_none());
        assert!(inner.handle_text(text).is_none());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.is_snapshot);
        assert!(second.is_snapshot);
        assert_eq!(first.final_update_id, 1588086810556025);
        assert_eq!(first.bids[0].price, dec!(8732.06));
    }

    #[tokio::test]
    async fn venue_reconnect_request_is_surfaced() {
        let inner = inner();
        assert_eq!(
            inner.handle_text(r#"{"event":"bts:request_reconnect","channel":"","data":""}"#),
            Some(TransitionReason::VenueDisconnect)
        );
    }

    #[tokio::test]
    async fn acks_are_ignored() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        assert!(inner
            .handle_text(
                r#"{"event":"bts:subscription_succeeded","channel":"order_book_btcusd","data":{}}"#
            )
            .is_none());
        assert!(rx.try_recv().is_err());
    }
}
