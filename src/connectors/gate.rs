//! Gate.io spot connector, `spot.order_book_update` channel.
//!
//! Out-of-band snapshot venue like Binance spot: deltas are buffered
//! while the REST book (with id) is fetched, aligned on
//! `U == prev_u + 1`, and any break forces a resync. Heartbeat is the
//! application-level `spot.ping` channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::models::{DepthUpdate, HealthSnapshot, Snapshot, Venue};

use super::binance::snapshot_as_update;
use super::session::{ConnectorState, TransitionReason};
use super::sync::{ContinuityRule, DeltaSequencer, SeqAction};
use super::ws::{self, WsSource};
use super::{
    check_staleness, millis_to_utc, pairs_to_levels, schedule_reconnect, Connector, ConnectorCore,
    VenueStream, HEARTBEAT_INTERVAL, SNAPSHOT_WAIT,
};

const WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
const REST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct WsFrame {
    channel: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BookDelta {
    #[serde(rename = "t")]
    time_ms: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_id: u64,
    #[serde(rename = "u")]
    final_id: u64,
    #[serde(rename = "b", default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a", default)]
    asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
struct RestBook {
    id: u64,
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

/// `BTCUSDT -> BTC_USDT`; pair-style input passes through.
fn to_currency_pair(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    if symbol.contains('_') {
        return symbol;
    }
    for quote in ["USDT", "USDC", "USD", "BTC", "ETH"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}_{quote}");
            }
        }
    }
    symbol
}

pub struct GateConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
    http: reqwest::Client,
}

impl GateConnector {
    pub fn new(symbol: &str) -> Arc<Self> {
        let native = to_currency_pair(symbol);
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(Venue::Gate, symbol, native, 1024),
                http: reqwest::Client::new(),
            }),
        })
    }
}

#[async_trait]
impl Connector for GateConnector {
    fn venue(&self) -> Venue {
        Venue::Gate
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
            "time": Utc::now().timestamp(),
            "channel": "spot.order_book_update",
            "event": "subscribe",
            "payload": [self.core.native_symbol(), "100ms"],
        });
        self.core
            .send_text(subscribe.to_string())
            .await
            .context("subscribe failed")?;

        self.core.health.set_connected(true);
        info!(venue = %self.core.venue(), pair = self.core.native_symbol(), "websocket connected and subscribed");

        let generation = self.core.bump_generation();
        tokio::spawn(self.clone().read_loop(source, generation));
        tokio::spawn(self.clone().heartbeat_loop(generation));
        Ok(())
    }
}

impl Inner {
    async fn read_loop(self: Arc<Self>, mut source: WsSource, generation: u64) {
        self.core
            .session
            .transition(ConnectorState::Syncing, TransitionReason::SubscriptionSent);

        let mut sequencer = match self.sync(&mut source).await {
            Ok(sequencer) => sequencer,
            Err(err) => {
                warn!(venue = %self.core.venue(), error = %err, "snapshot sync failed");
                self.core.health.record_error();
                schedule_reconnect(&self, TransitionReason::SequenceGap);
                return;
            }
        };
        self.core
            .session
            .transition(ConnectorState::Streaming, TransitionReason::SnapshotSynced);

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
                    let Some(delta) = self.parse_delta(&text) else {
                        continue;
                    };
                    self.core.health.record_message();
                    match sequencer.check(&delta) {
                        Ok(SeqAction::Apply) => self.core.emit(delta),
                        Ok(SeqAction::Skip) => {}
                        Err(err) => {
                            warn!(venue = %self.core.venue(), error = %err, "resyncing");
                            schedule_reconnect(&self, TransitionReason::SequenceGap);
                            return;
                        }
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

    async fn sync(&self, source: &mut WsSource) -> Result<DeltaSequencer> {
        let mut buffered: Vec<DepthUpdate> = Vec::new();
        let snapshot_fut = self.fetch_rest_snapshot();
        tokio::pin!(snapshot_fut);

        let snapshot = loop {
            tokio::select! {
                snapshot = &mut snapshot_fut => break snapshot?,
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(delta) = self.parse_delta(&text) {
                            self.core.health.record_message();
                            buffered.push(delta);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err).context("read during sync"),
                    None => bail!("stream ended during sync"),
                },
            }
        };

        let mut sequencer =
            DeltaSequencer::after_snapshot(ContinuityRule::FirstFollowsFinal, snapshot.last_update_id);
        let aligned = sequencer.align(buffered)?;
        debug!(
            venue = %self.core.venue(),
            snapshot_id = snapshot.last_update_id,
            aligned = aligned.len(),
            "snapshot aligned"
        );

        self.core.publish_snapshot(snapshot.clone());
        self.core.emit(snapshot_as_update(&snapshot));
        for delta in aligned {
            self.core.emit(delta);
        }
        Ok(sequencer)
    }

    async fn fetch_rest_snapshot(&self) -> Result<Snapshot> {
        let url = format!(
            "https://api.gateio.ws/api/v4/spot/order_book?currency_pair={}&limit=1000&with_id=true",
            self.core.native_symbol()
        );
        let response = tokio::time::timeout(REST_TIMEOUT, self.http.get(&url).send())
            .await
            .context("snapshot request timed out")?
            .context("snapshot request failed")?
            .error_for_status()
            .context("snapshot request rejected")?;
        let book: RestBook = tokio::time::timeout(REST_TIMEOUT, response.json())
            .await
            .context("snapshot body timed out")?
            .context("snapshot decode failed")?;

        Ok(Snapshot {
            venue: self.core.venue(),
            symbol: self.core.native_symbol().to_string(),
            last_update_id: book.id,
            bids: pairs_to_levels(book.bids),
            asks: pairs_to_levels(book.asks),
            observed_at: Utc::now(),
        })
    }

    fn parse_delta(&self, text: &str) -> Option<DepthUpdate> {
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => return None,
        };
        match frame.channel.as_str() {
            "spot.order_book_update" => {}
            "spot.pong" => {
                self.core.health.touch();
                return None;
            }
            _ => return None,
        }
        if frame.event == "subscribe" {
            if let Some(error) = frame.error {
                warn!(venue = %self.core.venue(), %error, "subscription rejected");
                self.core.health.record_error();
            }
            return None;
        }
        if frame.event != "update" {
            return None;
        }

        let delta: BookDelta = match serde_json::from_value(frame.result?) {
            Ok(delta) => delta,
            Err(err) => {
                debug!(venue = %self.core.venue(), error = %err, "undecodable book delta");
                return None;
            }
        };
        Some(DepthUpdate {
            venue: self.core.venue(),
            symbol: delta.symbol,
            event_time: millis_to_utc(delta.time_ms),
            first_update_id: delta.first_id,
            final_update_id: delta.final_id,
            prev_update_id: 0,
            bids: pairs_to_levels(delta.bids),
            asks: pairs_to_levels(delta.asks),
            is_snapshot: false,
        })
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
            let ping = json!({ "time": Utc::now().timestamp(), "channel": "spot.ping" });
            if let Err(err) = self.core.send_text(ping.to_string()).await {
                warn!(venue = %self.core.venue(), error = %err, "ping send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inner() -> Arc<Inner> {
        GateConnector::new("BTCUSDT").inner.clone()
    }

    #[test]
    fn symbol_translation() {
        assert_eq!(to_currency_pair("BTCUSDT"), "BTC_USDT");
        assert_eq!(to_currency_pair("ethusdc"), "ETH_USDC");
        assert_eq!(to_currency_pair("BTC_USDT"), "BTC_USDT");
    }

    #[test]
    fn parses_update_frame() {
        let inner = inner();
        let text = r#"{"time":1606294781,"time_ms":1606294781236,"channel":"spot.order_book_update","event":"update","result":{"t":1606294781123,"e":"depthUpdate","E":1606294781,"s":"BTC_USDT","U":48776301,"u":48776306,"b":[["19137.74","0.0001"]],"a":[["19137.75","0.6135"]]}}"#;
        let delta = inner.parse_delta(text).unwrap();
        assert_eq!(delta.venue, Venue::Gate);
        assert_eq!(delta.first_update_id, 48776301);
        assert_eq!(delta.final_update_id, 48776306);
        assert_eq!(delta.bids[0].price, dec!(19137.74));
        assert!(!delta.is_snapshot);
    }

    #[test]
    fn ignores_ack_and_pong_frames() {
        let inner = inner();
        assert!(inner
            .parse_delta(
                r#"{"time":1,"channel":"spot.order_book_update","event":"subscribe","result":{"status":"success"}}"#
            )
            .is_none());
        assert!(inner
            .parse_delta(r#"{"time":1,"channel":"spot.pong","event":"","result":null}"#)
            .is_none());
        assert!(inner.core.health_snapshot().last_message_at.is_some());
    }

    #[test]
    fn rest_book_decodes() {
        let raw = r#"{"id":123456,"current":1623898993123,"update":1623898993121,"asks":[["1.52","1.151"]],"bids":[["1.17","201.863"]]}"#;
        let book: RestBook = serde_json::from_str(raw).unwrap();
        assert_eq!(book.id, 123456);
        assert_eq!(book.bids[0].1, dec!(201.863));
    }
}
