use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orderbook_aggregator::engine::Engine;
use orderbook_aggregator::models::Config;
use orderbook_aggregator::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env();
    info!(
        symbol = %config.symbol,
        port = config.port,
        venues = config.venues.len(),
        "starting order book aggregator"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Engine::start(&config, shutdown_rx.clone());
    let state = AppState::new(engine);
    tokio::spawn(server::broadcast_loop(state.clone(), shutdown_rx.clone()));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    let app = server::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    // Give connectors a moment to send transport closes.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orderbook_aggregator=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
