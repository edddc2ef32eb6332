//! Broadcast server: WebSocket fan-out plus the health probe, one
//! listener for both.
//!
//! A single 200 ms timer samples every venue book, serializes the top-N
//! view and statistics record per venue, and fans the frames out to all
//! connected clients through bounded per-client queues. A slow client
//! loses broadcasts, never delays them; one that stays saturated for
//! five consecutive ticks is disconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::models::{ClientFrame, ServerFrame};

pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_DEPTH: usize = 20;

/// Frames a client may have in flight before broadcasts drop.
const CLIENT_BUFFER: usize = 64;

/// Consecutive saturated ticks before a client is disconnected.
const MAX_SATURATED_TICKS: u32 = 5;

struct ClientHandle {
    tx: mpsc::Sender<String>,
    saturated_ticks: u32,
}

/// Connected-client registry with the outbound drop/disconnect policy.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (u64, mpsc::Receiver<String>) {
        self.register_with_buffer(CLIENT_BUFFER)
    }

    fn register_with_buffer(&self, buffer: usize) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer);
        self.clients.write().insert(
            id,
            ClientHandle {
                tx,
                saturated_ticks: 0,
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.clients.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Delivers one tick's frames to every client. A full buffer drops
    /// the whole broadcast for that client; staying saturated across the
    /// threshold drops the client itself (its queue sender is removed,
    /// which closes the socket's forward loop).
    pub fn fan_out(&self, frames: &[String]) {
        let mut kicked: Vec<u64> = Vec::new();
        {
            let mut clients = self.clients.write();
            for (id, handle) in clients.iter_mut() {
                let mut saturated = false;
                for frame in frames {
                    match handle.tx.try_send(frame.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            saturated = true;
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            kicked.push(*id);
                            saturated = false;
                            break;
                        }
                    }
                }
                if saturated {
                    handle.saturated_ticks += 1;
                    if handle.saturated_ticks >= MAX_SATURATED_TICKS {
                        kicked.push(*id);
                    }
                } else {
                    handle.saturated_ticks = 0;
                }
            }
            for id in &kicked {
                clients.remove(id);
            }
        }
        for id in kicked {
            info!(client = id, "dropping slow or closed client");
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub registry: Arc<ClientRegistry>,
    /// Global aggregation tick; zero broadcasts raw levels.
    pub tick: Arc<RwLock<Decimal>>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            registry: Arc::new(ClientRegistry::new()),
            tick: Arc::new(RwLock::new(Decimal::ZERO)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            crate::middleware::request_logging,
        ))
        .with_state(state)
}

/// The single broadcast timer: sample books, serialize after releasing
/// the locks, fan out.
pub async fn broadcast_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        if state.registry.is_empty() {
            continue;
        }

        let tick = *state.tick.read();
        let samples = state.engine.sample(tick, DEFAULT_DEPTH);

        let mut frames = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            let exchange = sample.venue.as_str();
            frames.push(encode(&ServerFrame::Orderbook {
                exchange,
                bids: sample.view.bids,
                asks: sample.view.asks,
            }));
            if let Some(record) = sample.stats {
                frames.push(encode(&ServerFrame::Stats { exchange, record }));
            }
        }
        state.registry.fan_out(&frames);
    }
}

fn encode(frame: &ServerFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|err| {
        warn!(error = %err, "failed to serialize outbound frame");
        "{}".to_string()
    })
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut outbound) = state.registry.register();
    info!(client = id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Kicked by the slow-client policy or server shutdown.
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_client_frame(&state, id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(client = id, error = %err, "client read error");
                    break;
                }
            }
        }
    }

    state.registry.unregister(id);
    info!(client = id, "websocket client disconnected");
}

/// Control frames steer global state; malformed input is logged and
/// ignored without dropping the client.
fn handle_client_frame(state: &AppState, client: u64, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::SetTick { tick }) => {
            if tick < Decimal::ZERO {
                warn!(client, %tick, "ignoring negative aggregation tick");
                return;
            }
            info!(client, %tick, "aggregation tick changed");
            *state.tick.write() = tick;
        }
        Ok(ClientFrame::ChangeSymbol { symbol }) => {
            info!(client, %symbol, "symbol change requested");
            state.engine.change_symbol(&symbol);
        }
        Err(err) => {
            warn!(client, error = %err, "malformed control frame");
        }
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "time": Utc::now().timestamp() }))
}
