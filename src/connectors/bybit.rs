//! Bybit linear perpetual connector.
//!
//! In-band snapshot venue: the first `orderbook` frame after subscribing
//! carries the full book, subsequent frames are deltas sequenced by
//! `seq`. The server expects an application-level `{"op":"ping"}`.

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

use crate::models::{DepthUpdate, HealthSnapshot, Snapshot, Venue};

use super::session::{ConnectorState, TransitionReason};
use super::ws::{self, WsSource};
use super::{
    check_staleness, millis_to_utc, pairs_to_levels, schedule_reconnect, Connector, ConnectorCore,
    VenueStream, HEARTBEAT_INTERVAL, SNAPSHOT_WAIT,
};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const BOOK_DEPTH: u32 = 200;

#[derive(Debug, Deserialize)]
struct PushFrame {
    topic: String,
    #[serde(rename = "type")]
    kind: String,
    ts: i64,
    data: BookData,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b", default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a", default)]
    asks: Vec<(Decimal, Decimal)>,
    #[serde(rename = "u")]
    update_id: u64,
    seq: u64,
}

/// Operational responses: subscribe acks and pongs.
#[derive(Debug, Deserialize)]
struct OpFrame {
    op: Option<String>,
    success: Option<bool>,
    ret_msg: Option<String>,
}

pub struct BybitConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
    last_seq: AtomicU64,
}

impl BybitConnector {
    pub fn new(symbol: &str) -> Arc<Self> {
        let native = symbol.to_uppercase();
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(Venue::Bybit, symbol, native, 4096),
                last_seq: AtomicU64::new(0),
            }),
        })
    }
}

#[async_trait]
impl Connector for BybitConnector {
    fn venue(&self) -> Venue {
        Venue::Bybit
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

        let topic = format!("orderbook.{BOOK_DEPTH}.{}", self.core.native_symbol());
        let subscribe = json!({ "op": "subscribe", "args": [topic] });
        self.core
            .send_text(subscribe.to_string())
            .await
            .context("subscribe failed")?;

        self.core.health.set_connected(true);
        info!(venue = %self.core.venue(), "websocket connected and subscribed");
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
        // Subscribe acks and pongs come without a topic.
        if let Ok(op) = serde_json::from_str::<OpFrame>(text) {
            match op.op.as_deref() {
                Some("subscribe") => {
                    if op.success == Some(false) {
                        warn!(
                            venue = %self.core.venue(),
                            reason = op.ret_msg.as_deref().unwrap_or(""),
                            "subscription rejected"
                        );
                        self.core.health.record_error();
                    }
                    return;
                }
                Some("ping") | Some("pong") => {
                    self.core.health.touch();
                    return;
                }
                _ => {}
            }
        }

        let frame: PushFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if !frame.topic.starts_with("orderbook.") || frame.data.symbol.is_empty() {
            return;
        }
        self.core.health.record_message();

        let is_snapshot = frame.kind == "snapshot" || frame.data.update_id == 1;
        let prev_seq = self.last_seq.swap(frame.data.seq, Ordering::Relaxed);

        if is_snapshot {
            let snapshot = Snapshot {
                venue: self.core.venue(),
                symbol: frame.data.symbol.clone(),
                last_update_id: frame.data.seq,
                bids: pairs_to_levels(frame.data.bids.clone()),
                asks: pairs_to_levels(frame.data.asks.clone()),
                observed_at: millis_to_utc(frame.ts),
            };
            self.core.publish_snapshot(snapshot);
            self.core
                .session
                .transition(ConnectorState::Streaming, TransitionReason::SnapshotSynced);
        }

        self.core.emit(DepthUpdate {
            venue: self.core.venue(),
            symbol: frame.data.symbol,
            event_time: millis_to_utc(frame.ts),
            first_update_id: frame.data.seq,
            final_update_id: frame.data.seq,
            prev_update_id: if is_snapshot { 0 } else { prev_seq },
            bids: pairs_to_levels(frame.data.bids),
            asks: pairs_to_levels(frame.data.asks),
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
            if let Err(err) = self.core.send_text(json!({"op": "ping"}).to_string()).await {
                warn!(venue = %self.core.venue(), error = %err, "ping send failed");
            }
        }
    }
}
