//! Shared WebSocket transport helpers for the venue connectors.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a WebSocket endpoint with a bounded handshake window.
pub(crate) async fn dial(url: &str) -> Result<WsStream> {
    let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .with_context(|| format!("websocket handshake timed out: {url}"))?
        .with_context(|| format!("websocket connection failed: {url}"))?;
    Ok(stream)
}
