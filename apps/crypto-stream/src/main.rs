//! Crypto Stream Binary
//!
//! Starts trade ingestion, batched persistence, and the subscriber and
//! health servers.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin crypto-stream
//! ```
//!
//! # Environment Variables
//!
//! - `CRYPTO_PAIRS`: Comma-separated symbols (default: btcusdt,ethusdt,bnbusdt,solusdt,xrpusdt)
//! - `BINANCE_WEBSOCKET_URI`: Upstream URL (default: <wss://stream.binance.com:9443/ws>)
//! - `DATA_SAVE_INTERVAL_SECS`: Flush interval (default: 10)
//! - `STREAM_RECONNECT_DELAY_INITIAL_MS`: Reconnect delay (default: 5000)
//! - `STREAM_RECONNECT_DELAY_MULTIPLIER`: Backoff multiplier (default: 1.0, fixed)
//! - `STREAM_BUFFER_MAX_RECORDS` / `STREAM_BUFFER_OVERFLOW`: Buffer bound and policy
//! - `STREAM_SUBSCRIBER_CAPACITY`: Per-subscriber queue depth (default: 256)
//! - `STREAM_WS_PORT`: Subscriber WebSocket port (default: 8000)
//! - `STREAM_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crypto_stream::application::ports::TradeStore;
use crypto_stream::application::services::BatchFlusher;
use crypto_stream::domain::batch::BatchBuffer;
use crypto_stream::infrastructure::binance::{IngestionClient, IngestionClientConfig};
use crypto_stream::infrastructure::broadcast::{BroadcastConfig, FanoutBroker};
use crypto_stream::infrastructure::health::{HealthServer, HealthServerState};
use crypto_stream::infrastructure::persistence::InMemoryTradeStore;
use crypto_stream::infrastructure::telemetry;
use crypto_stream::infrastructure::websocket::{SubscriberServer, SubscriberServerState};
use crypto_stream::{StreamConfig, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Crypto Stream");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = StreamConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let store: Arc<dyn TradeStore> = Arc::new(InMemoryTradeStore::new());
    let buffer = Arc::new(BatchBuffer::new(config.buffer.limit()));
    let flusher = Arc::new(BatchFlusher::new(
        Arc::clone(&buffer),
        Arc::clone(&store),
        config.buffer.flush_interval,
    ));
    let broker = Arc::new(FanoutBroker::new(BroadcastConfig::from(config.broadcast)));

    let client = Arc::new(IngestionClient::new(
        IngestionClientConfig::from_settings(&config.upstream, config.symbols.clone()),
        flusher,
        Arc::clone(&broker),
        Arc::clone(&store),
        shutdown_token.clone(),
    ));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        config.symbols.clone(),
        client.feed_state(),
        Arc::clone(&broker),
        Arc::clone(&buffer),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    let subscriber_server = SubscriberServer::new(
        config.server.ws_port,
        Arc::new(SubscriberServerState::new(
            Arc::clone(&broker),
            Arc::clone(&store),
            shutdown_token.clone(),
        )),
    );

    let ingestion = client.start();

    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let subscriber_task = tokio::spawn(async move {
        if let Err(e) = subscriber_server.run().await {
            tracing::error!(error = %e, "Subscriber server error");
        }
    });

    tracing::info!("Crypto stream ready");

    await_shutdown(shutdown_token).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, ingestion.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Ingestion stopped with error"),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Ingestion shutdown timed out"
        ),
    }

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = health_task.await;
        let _ = subscriber_task.await;
    })
    .await;

    tracing::info!("Crypto stream stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    let symbols: Vec<&str> = config.symbols.iter().map(|s| s.as_str()).collect();
    tracing::info!(
        symbols = ?symbols,
        flush_interval_secs = config.buffer.flush_interval.as_secs(),
        buffer_limit = ?config.buffer.max_records,
        overflow = config.buffer.overflow.as_str(),
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(url = %config.upstream.url, "Upstream endpoint");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT) or for ingestion to give up.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Ingestion stopped, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
