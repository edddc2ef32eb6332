//! Binance connector: spot and USD-M futures diff depth streams.
//!
//! Out-of-band snapshot venue: the diff stream is opened first, deltas
//! are buffered while the REST snapshot is in flight, and the buffer is
//! aligned against the snapshot id before anything reaches the book.
//! Spot chains on `U == prev_u + 1`; futures carries an explicit `pu`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::models::{DepthUpdate, HealthSnapshot, Snapshot, Venue};

use super::session::{ConnectorState, TransitionReason};
use super::sync::{ContinuityRule, DeltaSequencer, SeqAction};
use super::ws::{self, WsSource};
use super::{
    millis_to_utc, pairs_to_levels, passive_heartbeat, schedule_reconnect, Connector,
    ConnectorCore, VenueStream, SNAPSHOT_WAIT,
};

const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Which Binance market the connector speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Market {
    Spot,
    UsdFutures,
}

impl Market {
    fn venue(self) -> Venue {
        match self {
            Market::Spot => Venue::Binance,
            Market::UsdFutures => Venue::BinanceFutures,
        }
    }

    fn ws_url(self, symbol: &str) -> String {
        let stream = symbol.to_lowercase();
        match self {
            Market::Spot => format!("wss://stream.binance.com:9443/ws/{stream}@depth@100ms"),
            Market::UsdFutures => format!("wss://fstream.binance.com/ws/{stream}@depth@100ms"),
        }
    }

    fn rest_url(self, symbol: &str) -> String {
        match self {
            Market::Spot => {
                format!("https://api.binance.com/api/v3/depth?symbol={symbol}&limit=1000")
            }
            Market::UsdFutures => {
                format!("https://fapi.binance.com/fapi/v1/depth?symbol={symbol}&limit=1000")
            }
        }
    }

    fn continuity_rule(self) -> ContinuityRule {
        match self {
            Market::Spot => ContinuityRule::FirstFollowsFinal,
            Market::UsdFutures => ContinuityRule::PrevMatchesFinal,
        }
    }
}

/// Diff depth stream frame. Futures frames additionally carry `pu`.
#[derive(Debug, Deserialize)]
struct DiffFrame {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "U")]
    first_id: u64,
    #[serde(rename = "u")]
    final_id: u64,
    #[serde(rename = "pu", default)]
    prev_id: u64,
    #[serde(rename = "b", default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a", default)]
    asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestDepth {
    last_update_id: u64,
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

pub struct BinanceConnector {
    inner: Arc<Inner>,
}

struct Inner {
    core: ConnectorCore,
    market: Market,
    http: reqwest::Client,
}

impl BinanceConnector {
    pub fn new(market: Market, symbol: &str) -> Arc<Self> {
        let native = symbol.to_uppercase();
        Arc::new(Self {
            inner: Arc::new(Inner {
                core: ConnectorCore::new(market.venue(), symbol, native, 1024),
                market,
                http: reqwest::Client::new(),
            }),
        })
    }
}

#[async_trait]
impl Connector for BinanceConnector {
    fn venue(&self) -> Venue {
        self.inner.core.venue()
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

        let url = self.market.ws_url(self.core.native_symbol());
        let stream = match ws::dial(&url).await {
            Ok(stream) => stream,
            Err(err) => {
                self.core.health.record_error();
                return Err(err);
            }
        };
        // The stream name in the URL subscribes implicitly.
        self.core.session.transition(
            ConnectorState::Subscribing,
            TransitionReason::TransportEstablished,
        );

        let (sink, source) = stream.split();
        self.core.store_writer(sink).await;
        self.core.health.set_connected(true);
        info!(venue = %self.core.venue(), "websocket connected");

        let generation = self.core.bump_generation();
        tokio::spawn(self.clone().read_loop(source, generation));
        tokio::spawn(passive_heartbeat(self.clone(), generation));
        Ok(())
    }
}

impl Inner {
    /// Buffers deltas while the REST snapshot is fetched, aligns the
    /// buffer, then streams with continuity checking.
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

    /// The out-of-band snapshot walk: read and buffer deltas until the
    /// REST snapshot resolves, then align and emit.
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

        let mut sequencer = DeltaSequencer::after_snapshot(
            self.market.continuity_rule(),
            snapshot.last_update_id,
        );
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
        let url = self.market.rest_url(self.core.native_symbol());
        let response = tokio::time::timeout(REST_TIMEOUT, self.http.get(&url).send())
            .await
            .context("snapshot request timed out")?
            .context("snapshot request failed")?
            .error_for_status()
            .context("snapshot request rejected")?;
        let depth: RestDepth = tokio::time::timeout(REST_TIMEOUT, response.json())
            .await
            .context("snapshot body timed out")?
            .context("snapshot decode failed")?;

        Ok(Snapshot {
            venue: self.core.venue(),
            symbol: self.core.native_symbol().to_string(),
            last_update_id: depth.last_update_id,
            bids: pairs_to_levels(depth.bids),
            asks: pairs_to_levels(depth.asks),
            observed_at: Utc::now(),
        })
    }

    fn parse_delta(&self, text: &str) -> Option<DepthUpdate> {
        let frame: DiffFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(venue = %self.core.venue(), error = %err, "undecodable frame");
                return None;
            }
        };
        if frame.event != "depthUpdate" {
            return None;
        }
        Some(DepthUpdate {
            venue: self.core.venue(),
            symbol: self.core.native_symbol().to_string(),
            event_time: millis_to_utc(frame.event_time),
            first_update_id: frame.first_id,
            final_update_id: frame.final_id,
            prev_update_id: frame.prev_id,
            bids: pairs_to_levels(frame.bids),
            asks: pairs_to_levels(frame.asks),
            is_snapshot: false,
        })
    }
}

/// Re-expresses a snapshot as a replace-update so post-reconnect books
/// reset through the ordinary stream.
pub(crate) fn snapshot_as_update(snapshot: &Snapshot) -> DepthUpdate {
    DepthUpdate {
        venue: snapshot.venue,
        symbol: snapshot.symbol.clone(),
        event_time: snapshot.observed_at,
        first_update_id: snapshot.last_update_id,
        final_update_id: snapshot.last_update_id,
        prev_update_id: 0,
        bids: snapshot.bids.clone(),
        asks: snapshot.asks.clone(),
        is_snapshot: true,
    }
}
