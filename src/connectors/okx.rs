//! OKX spot connector, `books` channel.
//!
//! In-band snapshot venue with explicit chain ids: the first push after
//! subscribing is `action: "snapshot"`, updates chain on
//! `prevSeqId == last seqId`. Liveness is the text `ping`/`pong` pair.

use std::sync::atomic::{AtomicU64, Ordering};
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
    check_staleness, millis_to_utc, schedule_reconnect, Connector, ConnectorCore, VenueStream,
    HEARTBEAT_INTERVAL, SNAPSHOT_WAIT,
};

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// `[price, size, liquidated, order_count]`.
type OkxLevel = (Decimal, Decimal, Decimal, Decimal);

#[derive(Debug, Deserialize)]
struct PushFrame {
    arg: Arg,
    action: String,
    data: Vec<BookData>,
}

#[derive(Debug, Deserialize)]
struct Arg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(default)]
    bids: Vec<OkxLevel>,
    #[serde(default)]
    asks: Vec<OkxLevel>,
    ts: String,
    #[serde(rename = "seqId")]
    seq_id: i64,
    #[serde(rename = "prevSeqId", default)]
    prev_seq_id: i64,
}

#[derive(Debug, Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

/// `BTCUSDT -> BTC-USDT`, `ETHUSD -> ETH-USD`; instrument-style input
/// passes through.
fn to_inst_id(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    if symbol.contains('-') {
        return symbol;
    }
    for quote in ["USDT", "USDC", "USD", "EUR", "BTC"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}-{quote}");
            }
        }
    }
    symbol
}

pub struct OkxConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
    last_seq: AtomicU64,
}

impl OkxConnector {
    pub fn new(symbol: &str) -> Arc<Self> {
        let native = to_inst_id(symbol);
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(Venue::Okx, symbol, native, 1024),
                last_seq: AtomicU64::new(0),
            }),
        })
    }
}

#[async_trait]
impl Connector for OkxConnector {
    fn venue(&self) -> Venue {
        Venue::Okx
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
            "op": "subscribe",
            "args": [{ "channel": "books", "instId": self.core.native_symbol() }],
        });
        self.core
            .send_text(subscribe.to_string())
            .await
            .context("subscribe failed")?;

        self.core.health.set_connected(true);
        info!(venue = %self.core.venue(), inst_id = self.core.native_symbol(), "websocket connected and subscribed");
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

    /// Returns a reason when the stream must be abandoned and resynced.
    fn handle_text(&self, text: &str) -> Option<TransitionReason> {
        if text == "pong" {
            self.core.health.touch();
            return None;
        }

        if let Ok(event) = serde_json::from_str::<EventFrame>(text) {
            match event.event.as_str() {
                "subscribe" => return None,
                "error" => {
                    warn!(
                        venue = %self.core.venue(),
                        code = event.code.as_deref().unwrap_or(""),
                        msg = event.msg.as_deref().unwrap_or(""),
                        "subscription rejected"
                    );
                    self.core.health.record_error();
                    return None;
                }
                _ => return None,
            }
        }

        let frame: PushFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => return None,
        };
        if frame.arg.channel != "books" {
            return None;
        }

        for data in frame.data {
            self.core.health.record_message();
            let is_snapshot = frame.action == "snapshot";
            let seq = data.seq_id.max(0) as u64;
            let prev = data.prev_seq_id.max(0) as u64;
            let last = self.last_seq.swap(seq, Ordering::Relaxed);

            if !is_snapshot && last != 0 && prev != last {
                warn!(
                    venue = %self.core.venue(),
                    expected = last,
                    got = prev,
                    "sequence gap, resyncing"
                );
                return Some(TransitionReason::SequenceGap);
            }

            let event_time = data
                .ts
                .parse::<i64>()
                .map(millis_to_utc)
                .unwrap_or_else(|_| chrono::Utc::now());
            let bids = to_levels(data.bids);
            let asks = to_levels(data.asks);

            if is_snapshot {
                self.core.publish_snapshot(Snapshot {
                    venue: self.core.venue(),
                    symbol: frame.arg.inst_id.clone(),
                    last_update_id: seq,
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
                symbol: frame.arg.inst_id.clone(),
                event_time,
                first_update_id: seq,
                final_update_id: seq,
                prev_update_id: if is_snapshot { 0 } else { prev },
                bids,
                asks,
                is_snapshot,
            });
        }
        None
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
            if let Err(err) = self.core.send_text("ping".to_string()).await {
                warn!(venue = %self.core.venue(), error = %err, "ping send failed");
            }
        }
    }
}

fn to_levels(raw: Vec<OkxLevel>) -> Vec<PriceLevel> {
    raw.into_iter()
        .map(|(price, quantity, _, _)| PriceLevel { price, quantity })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inner() -> Arc<Inner> {
        OkxConnector::new("BTCUSDT").inner.clone()
    }

    #[test]
    fn symbol_translation() {
        assert_eq!(to_inst_id("BTCUSDT"), "BTC-USDT");
        assert_eq!(to_inst_id("ethusd"), "ETH-USD");
        assert_eq!(to_inst_id("SOL-USDT"), "SOL-USDT");
    }

    #[tokio::test]
    async fn snapshot_then_chained_update() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        assert!(inner
            .handle_text(
                r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"snapshot","data":[{"asks":[["41006.8","0.60038921","0","1"]],"bids":[["41006.3","0.30178218","0","2"]],"ts":"1629966436396","checksum":-1404728904,"prevSeqId":-1,"seqId":10}]}"#,
            )
            .is_none());
        assert!(inner
            .handle_text(
                r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"update","data":[{"asks":[],"bids":[["41006.3","0","0","0"]],"ts":"1629966436397","checksum":22,"prevSeqId":10,"seqId":11}]}"#,
            )
            .is_none());

        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.is_snapshot);
        assert_eq!(snapshot.bids[0].price, dec!(41006.3));

        let update = rx.recv().await.unwrap();
        assert!(!update.is_snapshot);
        assert_eq!(update.prev_update_id, 10);
        assert_eq!(update.bids[0].quantity, dec!(0));
    }

    #[tokio::test]
    async fn gap_forces_resync() {
        let inner = inner();
        let _rx = inner.core.take_updates().unwrap();
        inner.handle_text(
            r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"snapshot","data":[{"asks":[],"bids":[],"ts":"1","prevSeqId":-1,"seqId":10}]}"#,
        );
        let reason = inner.handle_text(
            r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"update","data":[{"asks":[],"bids":[],"ts":"2","prevSeqId":12,"seqId":13}]}"#,
        );
        assert_eq!(reason, Some(TransitionReason::SequenceGap));
    }

    #[tokio::test]
    async fn control_frames_ignored() {
        let inner = inner();
        let mut rx = inner.core.take_updates().unwrap();
        assert!(inner.handle_text("pong").is_none());
        assert!(inner
            .handle_text(r#"{"event":"subscribe","arg":{"channel":"books","instId":"BTC-USDT"},"connId":"a"}"#)
            .is_none());
        assert!(inner
            .handle_text(r#"{"event":"error","code":"60012","msg":"bad request"}"#)
            .is_none());
        assert!(rx.try_recv().is_err());
    }
}
